//! Shared error model for cross-crate APIs.
//!
//! Wire-visible failures (wrong type, bad arity, NOAUTH, ...) are reply
//! values, not `Err` variants; this enum covers the faults that genuinely
//! abort an operation: I/O, malformed configuration, and runtime state
//! that makes a request impossible to serve.

use thiserror::Error;

/// Unified result type used by public interfaces in `carmine`.
pub type CarmineResult<T> = Result<T, CarmineError>;

/// Process-level error categories.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CarmineError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Client protocol payload is malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket or filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),

    /// A cluster peer is not part of the configured topology.
    #[error("peer not found: {0}")]
    PeerNotFound(String),
}

impl From<std::io::Error> for CarmineError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}
