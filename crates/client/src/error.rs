//! Error types for the client crate.

use protocol::{ErrorObject, ProtocolError};
use thiserror::Error;

/// Client error type.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// The server ended the session, e.g. `auth failed: ...` or `time out`.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The connection dropped without a reason.
    #[error("disconnected")]
    Disconnected,

    /// The server answered with an error.
    #[error("{0}")]
    Remote(ErrorObject),

    /// The server answered with something this client cannot interpret.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Transport failure while connecting.
    #[error("connection failed: {0}")]
    Connect(String),
}

impl ClientError {
    /// Errno-like code of a remote error.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Remote(error) => error.code.as_deref(),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        ClientError::Connect(err.to_string())
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
