//! Listener registry
//!
//! Tracks every registered listener connection together with the actions it
//! advertises.

mod manager;
mod session;

pub use manager::ListenerRegistry;
pub use session::{ActionStatus, AdvertisedAction, ListenerSession, ReplyRouting, SessionInfo};
