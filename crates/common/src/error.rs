//! Common error types for Seqloop
//!
//! This module defines all error types used across the Seqloop engine.
//! Errors travel back to callers either through a command acknowledgement
//! or, for generation failures, as the terminal event of a stream.

use seqloop_proto::{SessionId, WorkerId};
use thiserror::Error;

/// Main error type for Seqloop
#[derive(Error, Debug)]
pub enum SeqloopError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Command referenced a session with no pinning entry
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// Worker command queue closed or worker thread gone
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// No free context slot on the selected worker
    #[error("Worker {worker_id} at capacity ({capacity} sessions)")]
    WorkerAtCapacity { worker_id: WorkerId, capacity: usize },

    /// Queue full (backpressure)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Batch execution failed
    #[error("Compute failure: {0}")]
    ComputeFailure(String),

    /// Tokenizer or detokenizer failed
    #[error("Tokenization error: {0}")]
    Tokenization(String),

    /// Sampler could not pick a token
    #[error("Sampling error: {0}")]
    Sampling(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for SeqloopError {
    fn from(err: config::ConfigError) -> Self {
        SeqloopError::Config(err.to_string())
    }
}

impl SeqloopError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        SeqloopError::Config(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        SeqloopError::WorkerUnavailable(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        SeqloopError::QueueFull(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        SeqloopError::Timeout(msg.into())
    }

    /// Create a compute failure
    pub fn compute(msg: impl Into<String>) -> Self {
        SeqloopError::ComputeFailure(msg.into())
    }

    /// Create a tokenization error
    pub fn tokenization(msg: impl Into<String>) -> Self {
        SeqloopError::Tokenization(msg.into())
    }

    /// Create a sampling error
    pub fn sampling(msg: impl Into<String>) -> Self {
        SeqloopError::Sampling(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        SeqloopError::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        SeqloopError::Internal(msg.into())
    }

    /// Whether the failure happened while picking or reaching a worker
    pub fn is_routing_failure(&self) -> bool {
        matches!(
            self,
            SeqloopError::WorkerUnavailable(_)
                | SeqloopError::WorkerAtCapacity { .. }
                | SeqloopError::QueueFull(_)
                | SeqloopError::Timeout(_)
        )
    }
}

/// Result type alias for Seqloop operations
pub type Result<T> = std::result::Result<T, SeqloopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SeqloopError::UnknownSession(SessionId(42));
        assert_eq!(err.to_string(), "Unknown session: session-42");

        let err = SeqloopError::WorkerAtCapacity {
            worker_id: WorkerId(1),
            capacity: 8,
        };
        assert_eq!(err.to_string(), "Worker worker-1 at capacity (8 sessions)");
    }

    #[test]
    fn test_routing_failure_classification() {
        assert!(SeqloopError::worker_unavailable("gone").is_routing_failure());
        assert!(SeqloopError::queue_full("busy").is_routing_failure());
        assert!(!SeqloopError::UnknownSession(SessionId(1)).is_routing_failure());
        assert!(!SeqloopError::compute("nan").is_routing_failure());
    }
}
