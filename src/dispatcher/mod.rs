//! Dispatcher (broker) side
//!
//! Serves the trigger endpoints, upgrades listener connections on
//! `/ws/:token` and runs the registration protocol on each of them.

mod connection;
mod handler;
mod server;

pub use handler::{dispatcher_router, DispatcherState};
pub use server::{Dispatcher, DispatcherBuilder};
