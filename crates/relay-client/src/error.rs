//! Client error type.

use relay_wire::WireError;

/// Errors surfaced by the connection controller.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The controller is not currently connected.
    #[error("not connected")]
    NotConnected,

    /// The server answered with a typed error response.
    #[error("remote error [{code}]: {message}")]
    Remote {
        /// Machine-readable code (see [`relay_core::codes`]).
        code: String,
        /// Human-readable message.
        message: String,
        /// Diagnostic detail, present only outside production servers.
        stack: Option<String>,
    },

    /// A frame failed to encode or decode.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The server violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The controller was closed explicitly.
    #[error("connection closed")]
    Closed,

    /// Every reconnect attempt failed.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// How many connect attempts were made.
        attempts: u32,
    },

    /// Local filesystem failure during an upload.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// The remote error code, when this is a [`ClientError::Remote`].
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}
