//! Triggerhub - relay HTTP triggers to outbound-connected listeners
//!
//! Triggerhub lets services behind NAT or a firewall expose named actions
//! without opening an inbound port. Listeners dial the dispatcher, register
//! the actions they host, and run them when an HTTP trigger arrives.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP caller                     Dispatcher                        Listener
//! ┌──────────┐  GET /triggers/   ┌─────────────────────────┐  ws   ┌──────────────┐
//! │  curl /  │  deploy/TOK       │  Router (CORS, trace)   │◄──────│ join         │
//! │  webhook │──────────────────►│           │             │       │  register    │
//! └──────────┘                   │  ┌────────▼─────────┐   │       │  receive     │
//!       ▲                        │  │ RelayDispatcher  │   │ relay │  execute     │
//!       │                        │  └────────┬─────────┘   │──────►│  reply       │
//!       │   {ok, message}        │  ┌────────▼─────────┐   │result │              │
//!       └────────────────────────│  │ ListenerRegistry │   │◄──────│ ActionTable  │
//!                                │  └──────────────────┘   │       └──────────────┘
//!                                └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`dispatcher`]: HTTP surface, WebSocket upgrade and registration handshake
//! - [`registry`]: Live listener sessions and their advertised actions
//! - [`relay`]: Forwarding triggers and awaiting listener results
//! - [`listener`]: The outbound-connecting client and its action table
//! - [`protocol`]: JSON envelopes exchanged over the WebSocket
//! - [`config`]: Configuration management
//! - [`tls`]: PEM loading for the TLS listener

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod tls;

pub use config::TriggerhubConfig;
pub use error::{Error, Result};
