//! Client error types.

use cqlmock_protocol::ErrorCode;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] cqlmock_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("server error: {code:#06x} - {message}")]
    Server { code: i32, message: String },

    #[error("unexpected {0} response")]
    UnexpectedResponse(&'static str),

    #[error("no free stream ids")]
    StreamsExhausted,

    #[error("server requires authentication with {0}")]
    AuthenticationRequired(String),
}

impl ClientError {
    /// Returns the server error code, if this is a server error with a known code.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Server { code, .. } => ErrorCode::from_code(*code),
            _ => None,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Server { .. } => self.error_code().is_some_and(|c| c.is_retryable()),
            _ => false,
        }
    }
}
