//! Error types for IKE negotiation
//!
//! This module defines a unified error type for the ISAKMP codec, the
//! proposal database, the connection registry and the daemon plumbing.

use crate::isakmp::Notification;
use crate::whack::RcCode;
use std::fmt;

/// Result type for IKE operations
pub type Result<T> = std::result::Result<T, Error>;

/// IKE engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid ISAKMP message format
    InvalidMessage(String),

    /// Invalid ISAKMP payload
    InvalidPayload(String),

    /// Unsupported exchange type
    UnsupportedExchangeType(u8),

    /// Negotiation failed with an ISAKMP notification code
    Notification(Notification),

    /// Authentication failed
    AuthenticationFailed(String),

    /// Security Association not found
    SaNotFound(String),

    /// Cryptographic operation failed
    CryptoError(String),

    /// Invalid packet length
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Invalid Security Parameter Index
    InvalidSpi(u32),

    /// State machine error
    InvalidState(String),

    /// Invalid parameter supplied by the caller
    InvalidParameter(String),

    /// Configuration rejected
    Config(String),

    /// No connection with the given name
    ConnectionNotFound(String),

    /// Operator request refused; carries the control-plane status code
    Refused(RcCode, String),

    /// Kernel SA interface failure
    Kernel(String),

    /// I/O error
    Io(String),

    /// Internal error (should not happen)
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidMessage(msg) => write!(f, "Invalid ISAKMP message: {}", msg),
            Error::InvalidPayload(msg) => write!(f, "Invalid ISAKMP payload: {}", msg),
            Error::UnsupportedExchangeType(t) => {
                write!(f, "Unsupported exchange type: {}", t)
            }
            Error::Notification(n) => write!(f, "Negotiation failed: {}", n),
            Error::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            Error::SaNotFound(id) => write!(f, "Security Association not found: {}", id),
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::InvalidLength { expected, actual } => {
                write!(f, "Invalid length: expected {}, got {}", expected, actual)
            }
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::InvalidSpi(spi) => write!(f, "Invalid SPI: 0x{:08x}", spi),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::ConnectionNotFound(name) => write!(f, "no connection named \"{}\"", name),
            Error::Refused(_, reason) => write!(f, "{}", reason),
            Error::Kernel(msg) => write!(f, "Kernel error: {}", msg),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// Convert from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Notification> for Error {
    fn from(n: Notification) -> Self {
        Error::Notification(n)
    }
}

impl From<Error> for fynx_platform::FynxError {
    fn from(err: Error) -> Self {
        use fynx_platform::FynxError;
        match err {
            Error::Io(msg) => FynxError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg)),
            Error::Config(msg) | Error::InvalidParameter(msg) => FynxError::Config(msg),
            Error::ConnectionNotFound(name) => {
                FynxError::Config(format!("no connection named \"{}\"", name))
            }
            Error::Refused(rc, reason) => FynxError::Refused {
                code: rc.code(),
                reason,
            },
            Error::Kernel(msg) => FynxError::Dataplane(msg),
            Error::AuthenticationFailed(msg) | Error::CryptoError(msg) => {
                FynxError::Security(msg)
            }
            other => FynxError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidMessage("test".to_string());
        assert_eq!(err.to_string(), "Invalid ISAKMP message: test");

        let err = Error::UnsupportedExchangeType(7);
        assert_eq!(err.to_string(), "Unsupported exchange type: 7");

        let err = Error::InvalidLength {
            expected: 10,
            actual: 5,
        };
        assert_eq!(err.to_string(), "Invalid length: expected 10, got 5");

        let err = Error::Notification(Notification::NoProposalChosen);
        assert_eq!(err.to_string(), "Negotiation failed: NO_PROPOSAL_CHOSEN");
    }

    #[test]
    fn test_error_clone() {
        let err1 = Error::Notification(Notification::InvalidSpi);
        let err2 = err1.clone();
        assert_eq!(err1, err2);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        match err {
            Error::Io(msg) => assert!(msg.contains("file not found")),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_platform_conversion() {
        let err: fynx_platform::FynxError = Error::Config("bad".to_string()).into();
        assert!(matches!(err, fynx_platform::FynxError::Config(_)));

        let err: fynx_platform::FynxError = Error::InvalidSpi(3).into();
        assert!(matches!(err, fynx_platform::FynxError::Protocol(_)));

        let err: fynx_platform::FynxError =
            Error::Refused(RcCode::UnknownName, "no such connection".to_string()).into();
        assert_eq!(err.status_code(), Some(RcCode::UnknownName.code()));

        let err: fynx_platform::FynxError = Error::Kernel("no SPI".to_string()).into();
        assert!(matches!(err, fynx_platform::FynxError::Dataplane(_)));
    }
}
