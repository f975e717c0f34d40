//! Error type shared by the Fynx daemons

use std::fmt;

/// Error a daemon reports to the process hosting it
#[derive(Debug)]
pub enum FynxError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error
    Protocol(String),

    /// Authentication or admission failure
    Security(String),

    /// An operator request was refused; `code` is the daemon's status code
    Refused {
        /// Status code shown to the operator
        code: u16,
        /// Why the request was refused
        reason: String,
    },

    /// The packet-processing dataplane (kernel SAs, routes) failed
    Dataplane(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl FynxError {
    /// Status code for the operator, when the error carries one
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FynxError::Refused { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for FynxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FynxError::Io(e) => write!(f, "IO error: {}", e),
            FynxError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FynxError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            FynxError::Security(msg) => write!(f, "Security error: {}", msg),
            FynxError::Refused { code, reason } => write!(f, "Refused ({}): {}", code, reason),
            FynxError::Dataplane(msg) => write!(f, "Dataplane error: {}", msg),
            FynxError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for FynxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FynxError::Io(e) => Some(e),
            FynxError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FynxError {
    fn from(err: std::io::Error) -> Self {
        FynxError::Io(err)
    }
}

/// Result type for Fynx operations
pub type FynxResult<T> = Result<T, FynxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FynxError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
        let err = FynxError::Refused {
            code: 21,
            reason: "no connection named \"x\"".to_string(),
        };
        assert_eq!(err.to_string(), "Refused (21): no connection named \"x\"");
        assert_eq!(err.status_code(), Some(21));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let fynx_err: FynxError = io_err.into();
        assert!(matches!(fynx_err, FynxError::Io(_)));
        assert_eq!(fynx_err.status_code(), None);
    }

    #[test]
    fn test_other_keeps_source() {
        use std::error::Error;
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "socket closed");
        let err = FynxError::Other(Box::new(inner));
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Error: socket closed");
    }
}
