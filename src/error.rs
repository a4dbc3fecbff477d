//! Triggerhub error types

use thiserror::Error;

/// Triggerhub error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Listener registration rejected
    #[error("Registration error: {0}")]
    Registration(String),

    /// Transport error (socket closed, write failed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Local action execution error
    #[error("Action error: {0}")]
    Action(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket client error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result type alias for Triggerhub operations
pub type Result<T> = std::result::Result<T, Error>;
