//! Error types for the Restrictor library.

use thiserror::Error;

use crate::ratelimit::Decision;

/// Main error type for Restrictor operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The per-key lock is currently held by another caller
    #[error("Lock for key '{0}' is held by another caller")]
    LockContended(String),

    /// The store failed while trying to acquire the per-key lock
    #[error("Failed to acquire lock for key '{key}': {source}")]
    LockUnavailable {
        key: String,
        #[source]
        source: Box<LimiterError>,
    },

    /// Store backend errors
    #[error("Store error: {0}")]
    Store(String),

    /// Window state could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Redis errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for Restrictor operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

/// An error raised while deciding, paired with the decision the caller should
/// act on anyway.
///
/// Lock and load failures carry a fail-closed decision (`reached`, count 0).
/// A failed save carries the decision that was already computed.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct DecisionError {
    decision: Decision,
    #[source]
    source: LimiterError,
}

impl DecisionError {
    /// Pair an error with a best-effort decision.
    pub fn new(decision: Decision, source: LimiterError) -> Self {
        Self { decision, source }
    }

    /// The decision to act on despite the error.
    pub fn decision(&self) -> Decision {
        self.decision
    }

    /// The underlying error.
    pub fn error(&self) -> &LimiterError {
        &self.source
    }

    /// Split into the decision and the underlying error.
    pub fn into_parts(self) -> (Decision, LimiterError) {
        (self.decision, self.source)
    }
}
