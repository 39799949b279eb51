//! Error types for the Strata block engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the block engine
#[derive(Error, Debug)]
pub enum Error {
    /// Block absent from the local tier, the durable tier and the primary
    #[error("Block not found: {id}")]
    NotFound { id: String },

    /// Local slots, the segment pool or the cache are exhausted
    #[error("Out of capacity: {0}")]
    OutOfCapacity(String),

    /// Durable-tier put/get failure
    #[error("Durable backend error for {key}: {reason}")]
    Backend { key: String, reason: String },

    /// Reference counting or lifecycle misuse
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Offset outside the valid range of a block body
    #[error("Invalid offset {offset} (expected {expected})")]
    InvalidOffset { offset: usize, expected: usize },

    /// Append to an immutable segment
    #[error("Segment is full: {id}")]
    SegmentFull { id: String },

    /// Body operation on the wrong kind of block
    #[error("Operation {op} not supported on block {id}")]
    WrongKind { id: String, op: &'static str },

    /// Primary peer failure
    #[error("Primary peer error: {0}")]
    Peer(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation submitted after shutdown
    #[error("Shutting down: {0}")]
    Shutdown(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `NotFound` from anything displayable (usually a `BlockId`)
    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound { id: id.to_string() }
    }

    /// Build a `Backend` error for an object key
    pub fn backend(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Backend {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is transient and the operation may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Backend { .. } | Error::Io(_) | Error::Peer(_))
    }

    /// Check if this error means the block does not exist anywhere
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("D-1-2-3");
        assert_eq!(err.to_string(), "Block not found: D-1-2-3");

        let err = Error::InvalidOffset {
            offset: 10,
            expected: 4,
        };
        assert_eq!(err.to_string(), "Invalid offset 10 (expected 4)");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::backend("seg/1", "timeout").is_transient());
        assert!(Error::Peer("connection reset".into()).is_transient());
        assert!(Error::Io(std::io::Error::other("disk")).is_transient());
        assert!(!Error::OutOfCapacity("slots".into()).is_transient());
        assert!(!Error::ProtocolViolation("double release".into()).is_transient());
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::not_found("B7").is_not_found());
        assert!(!Error::Internal("x".into()).is_not_found());
    }
}
