//! Server error types.

use crate::config::ConfigError;
use gamewire_protocol::CommandCode;
use std::io;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] gamewire_protocol::ProtocolError),

    #[error("binding error: {0}")]
    Bind(#[from] gamewire_bind::BindError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("handler registry is sealed; cannot register {0}")]
    RegistrySealed(CommandCode),

    #[error("route '{0}' has no master code")]
    MissingMasterCode(String),

    #[error("handler for {code} failed: {message}")]
    Handler { code: CommandCode, message: String },

    #[error("session closed")]
    SessionClosed,

    #[error("peer is not reading its replies")]
    SlowConsumer,

    #[error("task queue full")]
    QueueFull,

    #[error("server shutting down")]
    ShuttingDown,

    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),

    #[error("{component} failed to {phase}: {message}")]
    Lifecycle {
        component: String,
        phase: &'static str,
        message: String,
    },
}

impl ServerError {
    /// Builds a handler failure from anything printable.
    pub fn handler(code: CommandCode, err: impl std::fmt::Display) -> Self {
        ServerError::Handler {
            code,
            message: err.to_string(),
        }
    }

    /// Returns whether this error means the peer is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ServerError::Io(e) => is_disconnect(e),
            ServerError::Protocol(gamewire_protocol::ProtocolError::Io(e)) => is_disconnect(e),
            ServerError::WebSocket(e) => {
                use tokio_tungstenite::tungstenite::Error as WsError;
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => true,
                    WsError::Io(e) => is_disconnect(e),
                    _ => false,
                }
            }
            ServerError::SessionClosed | ServerError::SlowConsumer => true,
            _ => false,
        }
    }
}

/// Classifies I/O errors that indicate a vanished peer.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        let reset = ServerError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_disconnect());

        let pipe = ServerError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(pipe.is_disconnect());

        let other = ServerError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(!other.is_disconnect());

        assert!(ServerError::SessionClosed.is_disconnect());
        assert!(ServerError::SlowConsumer.is_disconnect());
        assert!(!ServerError::QueueFull.is_disconnect());
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::RegistrySealed(CommandCode::new(1, 2));
        assert!(err.to_string().contains("(1,2)"));

        let err = ServerError::handler(CommandCode::new(3, 4), "boom");
        assert_eq!(err.to_string(), "handler for (3,4) failed: boom");
    }
}
