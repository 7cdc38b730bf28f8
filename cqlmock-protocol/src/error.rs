//! Protocol error types and CQL error codes.

use std::fmt;
use thiserror::Error;

/// Errors raised while decoding or encoding protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated input: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid length prefix: {0}")]
    InvalidLength(i32),

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("unexpected opcode {actual:#04x} for {context}")]
    UnexpectedOpcode { actual: u8, context: &'static str },

    #[error("unknown data type: {0:#06x}")]
    UnknownDataType(u16),

    #[error("unknown result kind: {0}")]
    UnknownResultKind(i32),

    #[error("value too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("{names} names given for {values} values")]
    MismatchedNames { names: usize, values: usize },
}

impl ProtocolError {
    pub(crate) fn truncated(needed: usize, remaining: usize) -> Self {
        ProtocolError::Truncated { needed, remaining }
    }
}

/// Error codes carried in the body of an ERROR frame.
///
/// The numeric values are fixed by the native protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    ServerError = 0x0000,
    Protocol = 0x000A,
    BadCredentials = 0x0100,
    Unavailable = 0x1000,
    Overloaded = 0x1001,
    IsBootstrapping = 0x1002,
    TruncateError = 0x1003,
    WriteTimeout = 0x1100,
    ReadTimeout = 0x1200,
    ReadFailure = 0x1300,
    FunctionFailure = 0x1400,
    WriteFailure = 0x1500,
    SyntaxError = 0x2000,
    Unauthorized = 0x2100,
    Invalid = 0x2200,
    ConfigError = 0x2300,
    AlreadyExists = 0x2400,
    Unprepared = 0x2500,
    ClientWriteFailure = 0x8000,
}

impl ErrorCode {
    const ALL: [ErrorCode; 19] = [
        ErrorCode::ServerError,
        ErrorCode::Protocol,
        ErrorCode::BadCredentials,
        ErrorCode::Unavailable,
        ErrorCode::Overloaded,
        ErrorCode::IsBootstrapping,
        ErrorCode::TruncateError,
        ErrorCode::WriteTimeout,
        ErrorCode::ReadTimeout,
        ErrorCode::ReadFailure,
        ErrorCode::FunctionFailure,
        ErrorCode::WriteFailure,
        ErrorCode::SyntaxError,
        ErrorCode::Unauthorized,
        ErrorCode::Invalid,
        ErrorCode::ConfigError,
        ErrorCode::AlreadyExists,
        ErrorCode::Unprepared,
        ErrorCode::ClientWriteFailure,
    ];

    /// Returns the wire value of this code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Looks up a known code. Unknown codes are still valid on the wire.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Returns whether a client may reasonably retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable
                | ErrorCode::Overloaded
                | ErrorCode::IsBootstrapping
                | ErrorCode::ReadTimeout
                | ErrorCode::WriteTimeout
        )
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ServerError => write!(f, "SERVER_ERROR"),
            ErrorCode::Protocol => write!(f, "PROTOCOL_ERROR"),
            ErrorCode::BadCredentials => write!(f, "BAD_CREDENTIALS"),
            ErrorCode::Unavailable => write!(f, "UNAVAILABLE"),
            ErrorCode::Overloaded => write!(f, "OVERLOADED"),
            ErrorCode::IsBootstrapping => write!(f, "IS_BOOTSTRAPPING"),
            ErrorCode::TruncateError => write!(f, "TRUNCATE_ERROR"),
            ErrorCode::WriteTimeout => write!(f, "WRITE_TIMEOUT"),
            ErrorCode::ReadTimeout => write!(f, "READ_TIMEOUT"),
            ErrorCode::ReadFailure => write!(f, "READ_FAILURE"),
            ErrorCode::FunctionFailure => write!(f, "FUNCTION_FAILURE"),
            ErrorCode::WriteFailure => write!(f, "WRITE_FAILURE"),
            ErrorCode::SyntaxError => write!(f, "SYNTAX_ERROR"),
            ErrorCode::Unauthorized => write!(f, "UNAUTHORIZED"),
            ErrorCode::Invalid => write!(f, "INVALID"),
            ErrorCode::ConfigError => write!(f, "CONFIG_ERROR"),
            ErrorCode::AlreadyExists => write!(f, "ALREADY_EXISTS"),
            ErrorCode::Unprepared => write!(f, "UNPREPARED"),
            ErrorCode::ClientWriteFailure => write!(f, "CLIENT_WRITE_FAILURE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::ServerError.code(), 0x0000);
        assert_eq!(ErrorCode::Protocol.code(), 0x000A);
        assert_eq!(ErrorCode::BadCredentials.code(), 0x0100);
        assert_eq!(ErrorCode::Invalid.code(), 0x2200);
        assert_eq!(ErrorCode::ClientWriteFailure.code(), 0x8000);
    }

    #[test]
    fn test_error_code_from_code() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0x7777), None);
    }

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::Unavailable.is_retryable());
        assert!(ErrorCode::Overloaded.is_retryable());
        assert!(ErrorCode::ReadTimeout.is_retryable());

        assert!(!ErrorCode::Protocol.is_retryable());
        assert!(!ErrorCode::BadCredentials.is_retryable());
        assert!(!ErrorCode::SyntaxError.is_retryable());
        assert!(!ErrorCode::Invalid.is_retryable());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::Protocol), "PROTOCOL_ERROR");
        assert_eq!(format!("{}", ErrorCode::BadCredentials), "BAD_CREDENTIALS");
        assert_eq!(format!("{}", ErrorCode::Invalid), "INVALID");
        assert_eq!(format!("{}", ErrorCode::Unprepared), "UNPREPARED");
        assert_eq!(
            format!("{}", ErrorCode::ClientWriteFailure),
            "CLIENT_WRITE_FAILURE"
        );
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::truncated(4, 1);
        let msg = err.to_string();
        assert!(msg.contains('4') && msg.contains('1'));

        let err = ProtocolError::UnsupportedVersion(6);
        assert!(err.to_string().contains('6'));

        let err = ProtocolError::UnknownOpcode(0x42);
        assert!(err.to_string().contains("0x42"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));

        let err = ProtocolError::TrailingBytes(3);
        assert!(err.to_string().contains('3'));
    }
}
