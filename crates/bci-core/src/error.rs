//! Error handling for the BCI pipeline
//!
//! A single error type is shared by every node and the pipeline engine so
//! failures propagate unchanged out of `Pipeline::process` to the owning
//! session. "Not ready yet" is not an error: nodes signal it with `Ok(None)`.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type BspResult<T> = Result<T, BspError>;

/// Error type for all pipeline operations
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum BspError {
    /// Block layout does not match what the node was configured for
    #[error("Shape mismatch in {node}: {reason}")]
    ShapeMismatch {
        /// Node that rejected the block
        node: String,
        /// Description of the mismatch
        reason: String,
    },

    /// Ring buffer write would overwrite unread samples
    #[error("Buffer capacity exceeded: {requested} new samples, {available} free of {capacity}")]
    CapacityExceeded {
        /// Total backing capacity in samples
        capacity: usize,
        /// Free slots before the write
        available: usize,
        /// Samples in the rejected write
        requested: usize,
    },

    /// Invalid construction-time settings
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Description of the invalid setting
        message: String,
    },

    /// Numerical breakdown inside an estimator
    #[error("Algorithmic instability in {stage}: {reason}")]
    AlgorithmicInstability {
        /// Algorithm stage that failed
        stage: &'static str,
        /// Description of the failure
        reason: String,
    },

    /// Timestamp vector not aligned with the time axis
    #[error("Invalid timestamps: expected {expected}, got {actual}")]
    InvalidTimestamps {
        /// Length of the time axis
        expected: usize,
        /// Length of the timestamp vector
        actual: usize,
    },

    /// Publishing to an external bus failed
    #[error("Publish error on stream '{stream}': {reason}")]
    Publish {
        /// Stream name
        stream: String,
        /// Failure description
        reason: String,
    },

    /// Session is no longer accepting chunks
    #[error("Session '{session}' stopped: {reason}")]
    SessionStopped {
        /// Session name
        session: String,
        /// Reason the session stopped
        reason: String,
    },
}

impl BspError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        BspError::ConfigurationError {
            message: message.into(),
        }
    }

    /// Shorthand for a shape mismatch raised by `node`
    pub fn shape(node: &str, reason: impl Into<String>) -> Self {
        BspError::ShapeMismatch {
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the owning session must stop after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BspError::Publish { .. })
    }
}
