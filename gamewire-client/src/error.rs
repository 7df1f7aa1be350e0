//! Client error types.

use gamewire_protocol::CommandCode;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] gamewire_protocol::ProtocolError),

    #[error("binding error: {0}")]
    Bind(#[from] gamewire_bind::BindError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("no reply to {0} in time")]
    Timeout(CommandCode),
}

impl ClientError {
    /// Returns whether retrying on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectionClosed
                | ClientError::ConnectTimeout
                | ClientError::Timeout(_)
        )
    }
}
