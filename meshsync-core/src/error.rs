//! Error vocabulary shared across record, RPC, and listener handling.
//!
//! `Error` covers process-local failures (decode errors, I/O). `ErrorCode`
//! is the wire vocabulary sent back to a client in an `E` frame — the two
//! overlap but aren't the same type, since many `ErrorCode`s (timeouts,
//! `MULTIPLE_ACCEPT`) are normal protocol signals, not failures.

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid message data: {0}")]
    InvalidMessageData(String),

    #[error("invalid listener pattern: {0}")]
    InvalidPattern(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cluster state error: {0}")]
    ClusterState(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Error codes sent to clients in an `E` frame on [`crate::Topic::Record`]
/// or [`crate::Topic::Rpc`]. These are the only error identifiers clients
/// should match on; the textual message is for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidMessageData,
    InvalidVersion,
    UnknownAction,
    RecordLoadError,
    RecordUpdateError,
    MultipleSubscriptions,
    NotSubscribed,
    MultipleAccept,
    InvalidRpcCorrelationId,
    AcceptTimeout,
    ResponseTimeout,
    NoRpcProvider,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessageData => "INVALID_MESSAGE_DATA",
            ErrorCode::InvalidVersion => "INVALID_VERSION",
            ErrorCode::UnknownAction => "UNKNOWN_ACTION",
            ErrorCode::RecordLoadError => "RECORD_LOAD_ERROR",
            ErrorCode::RecordUpdateError => "RECORD_UPDATE_ERROR",
            ErrorCode::MultipleSubscriptions => "MULTIPLE_SUBSCRIPTIONS",
            ErrorCode::NotSubscribed => "NOT_SUBSCRIBED",
            ErrorCode::MultipleAccept => "MULTIPLE_ACCEPT",
            ErrorCode::InvalidRpcCorrelationId => "INVALID_RPC_CORRELATION_ID",
            ErrorCode::AcceptTimeout => "ACCEPT_TIMEOUT",
            ErrorCode::ResponseTimeout => "RESPONSE_TIMEOUT",
            ErrorCode::NoRpcProvider => "NO_RPC_PROVIDER",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ErrorCode::NoRpcProvider.as_str(), "NO_RPC_PROVIDER");
        assert_eq!(ErrorCode::AcceptTimeout.to_string(), "ACCEPT_TIMEOUT");
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
