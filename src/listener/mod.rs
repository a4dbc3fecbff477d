//! Listener side ("join")
//!
//! A listener dials the dispatcher, registers its action names and then
//! serves relayed actions one at a time, replying with a result envelope.

mod actions;
mod client;

pub use actions::{ActionExecutor, ActionTable, ShellExecutor};
pub use client::ListenerClient;
