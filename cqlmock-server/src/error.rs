//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] cqlmock_protocol::ProtocolError),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("invalid node {0}")]
    InvalidNode(usize),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ServerError {
    /// Returns whether the error only affects a single connection.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_) | ServerError::Protocol(_) | ServerError::TlsHandshake(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ServerError::InvalidNode(3).to_string(), "invalid node 3");
        assert_eq!(
            ServerError::TlsConfig("cert_path not set".into()).to_string(),
            "TLS configuration error: cert_path not set"
        );
    }

    #[test]
    fn test_connection_local() {
        let io = ServerError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_connection_local());
        assert!(!ServerError::ShuttingDown.is_connection_local());
        assert!(!ServerError::InvalidNode(0).is_connection_local());
    }
}
