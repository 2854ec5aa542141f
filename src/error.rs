//! Error types for the metrics stream processor
//!
//! This module provides the error taxonomy for all processor operations:
//! input decoding, windowing, state management and downstream delivery.

use thiserror::Error;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Window-related errors
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// State backend and checkpoint errors
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Malformed input that failed schema-validated decoding
    #[error("decode error: {reason}")]
    Decode { reason: String },

    /// Downstream delivery failure after exhausting retries
    #[error("delivery failed to {boundary} after {attempts} attempts: {reason}")]
    Delivery {
        boundary: String,
        attempts: u32,
        reason: String,
    },

    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Execution errors
    #[error("execution error: {source}")]
    Execution {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected conditions
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// Window assignment and firing errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// Window length is invalid
    #[error("invalid window length: {length_ms}ms, must be greater than 0")]
    InvalidLength { length_ms: i64 },

    /// Event arrived past the allowed lateness for its window
    #[error("late event: window end {window_end} is past the lateness horizon, watermark {watermark}")]
    LateForWindow { window_end: i64, watermark: i64 },
}

/// State store and checkpoint errors
#[derive(Error, Debug)]
pub enum StateError {
    /// Checkpoint creation failed
    #[error("checkpoint {checkpoint_id} failed: {reason}")]
    CheckpointFailed { checkpoint_id: u64, reason: String },

    /// Checkpoint restoration failed
    #[error("restore failed: {reason}")]
    RestoreFailed { reason: String },

    /// No valid checkpoint was found for restore
    #[error("no valid checkpoint found in '{dir}'")]
    NoCheckpoint { dir: String },

    /// Checkpoint integrity verification failed
    #[error("checkpoint file '{path}' corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    /// State serialization failed
    #[error("state serialization failed: {reason}")]
    SerializationFailed { reason: String },

    /// Storage-level failure while persisting or pruning
    #[error("checkpoint storage error: {details}")]
    StorageError { details: String },
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

impl From<bincode::Error> for ProcessorError {
    fn from(err: bincode::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        ProcessorError::Unexpected(err.to_string())
    }
}
