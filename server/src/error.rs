//! Error types for the server.
//!
//! [`SyncError`] covers a single connection: every variant ends the connection
//! it was raised on and nothing else. Updates for identities that are no
//! longer registered are not errors at all, the store drops them silently.

use std::time::Duration;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Socket level failure (reset, broken pipe, failed write).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The peer sent something that does not decode as a state update.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A single snapshot write did not complete in time; the peer stopped
    /// reading.
    #[error("peer did not accept a snapshot within {0:?}")]
    WriteStalled(Duration),

    /// The peer's writer task has already exited.
    #[error("peer connection is closed")]
    PeerClosed,

    #[error("no message received for {0:?}")]
    IdleTimeout(Duration),
}

/// Rejected [`crate::config::ServerConfig`] values
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_clients must be at least 1")]
    NoClientSlots,

    #[error("write_timeout must be longer than zero")]
    ZeroWriteTimeout,

    #[error("idle_timeout must be longer than zero")]
    ZeroIdleTimeout,
}

/// Failures that stop the server from starting
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn protocol(err: impl std::fmt::Display) -> Self {
        SyncError::Protocol(err.to_string())
    }

    /// True for failures caused by the peer's payload rather than the socket.
    pub fn is_protocol(&self) -> bool {
        matches!(self, SyncError::Protocol(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::protocol(err)
    }
}
