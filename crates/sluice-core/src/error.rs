//! Error types and failure classification for sluice

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of a failed forward.
///
/// Every [`Error`] maps to exactly one kind, and every kind maps to exactly
/// one gateway status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Upstream did not produce a response head within the request deadline
    Timeout,
    /// Upstream refused the connection, could not be resolved, or connect timed out
    ConnectionUnreachable,
    /// Connection was reset or closed while an exchange was in flight
    ConnectionReset,
    /// No connection slot could be reserved within the pool limits
    PoolExhausted,
    /// Upstream sent something that is not a valid, in-order HTTP/1.1 response
    ProtocolViolation,
    /// The proxy was closed
    Closed,
    /// Anything else
    Unclassified,
}

impl FailureKind {
    /// All kinds, in declaration order
    pub const ALL: [FailureKind; 7] = [
        FailureKind::Timeout,
        FailureKind::ConnectionUnreachable,
        FailureKind::ConnectionReset,
        FailureKind::PoolExhausted,
        FailureKind::ProtocolViolation,
        FailureKind::Closed,
        FailureKind::Unclassified,
    ];

    /// Gateway status code answered to the client for this kind
    pub fn status_code(self) -> StatusCode {
        match self {
            FailureKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            FailureKind::PoolExhausted | FailureKind::Closed => StatusCode::SERVICE_UNAVAILABLE,
            FailureKind::ConnectionUnreachable
            | FailureKind::ConnectionReset
            | FailureKind::ProtocolViolation
            | FailureKind::Unclassified => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable snake_case name, as used in logs and error bodies
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionUnreachable => "connection_unreachable",
            FailureKind::ConnectionReset => "connection_reset",
            FailureKind::PoolExhausted => "pool_exhausted",
            FailureKind::ProtocolViolation => "protocol_violation",
            FailureKind::Closed => "closed",
            FailureKind::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for sluice
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Upstream response head did not arrive before the deadline
    #[error("Upstream did not respond within {0:?}")]
    Timeout(Duration),

    /// Upstream could not be reached
    #[error("Upstream {origin} unreachable: {reason}")]
    Unreachable {
        /// Origin that was dialed
        origin: String,
        /// Underlying cause
        reason: String,
    },

    /// Connection was reset or closed under an in-flight exchange
    #[error("Upstream connection reset: {0}")]
    ConnectionReset(String),

    /// Pool limits reached
    #[error("No upstream connection available for {0}")]
    PoolExhausted(String),

    /// Malformed, unsolicited or unsupported upstream response
    #[error("Upstream protocol violation: {0}")]
    ProtocolViolation(String),

    /// Proxy has been closed
    #[error("Proxy is closed")]
    Closed,

    /// Target path could not be applied to the base address
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Outbound request could not be framed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Inbound request body failed while it was streamed upstream
    #[error("Request body error: {0}")]
    RequestBody(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Timeout(_) => FailureKind::Timeout,
            Error::Unreachable { .. } => FailureKind::ConnectionUnreachable,
            Error::ConnectionReset(_) => FailureKind::ConnectionReset,
            Error::PoolExhausted(_) => FailureKind::PoolExhausted,
            Error::ProtocolViolation(_) => FailureKind::ProtocolViolation,
            Error::Closed => FailureKind::Closed,
            Error::Io(err) => match err.kind() {
                io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrNotAvailable => {
                    FailureKind::ConnectionUnreachable
                }
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => FailureKind::ConnectionReset,
                io::ErrorKind::TimedOut => FailureKind::Timeout,
                _ => FailureKind::Unclassified,
            },
            _ => FailureKind::Unclassified,
        }
    }

    /// Convert error to HTTP status code
    pub fn to_status_code(&self) -> StatusCode {
        self.kind().status_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_status_codes() {
        assert_eq!(
            FailureKind::Timeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            FailureKind::ConnectionUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            FailureKind::PoolExhausted.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            FailureKind::Unclassified.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            Error::Timeout(Duration::from_millis(100)).kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            Error::InvalidTarget("no slash".to_string()).kind(),
            FailureKind::Unclassified
        );
        assert_eq!(Error::Closed.to_status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let refused = Error::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.kind(), FailureKind::ConnectionUnreachable);

        let reset = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(reset.kind(), FailureKind::ConnectionReset);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(FailureKind::PoolExhausted.to_string(), "pool_exhausted");
        let json = serde_json::to_string(&FailureKind::ProtocolViolation).unwrap();
        assert_eq!(json, "\"protocol_violation\"");
    }
}
