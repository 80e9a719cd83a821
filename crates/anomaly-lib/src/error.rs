//! Error types for the detection engine

use thiserror::Error;

/// Errors surfaced by the detector and its collaborators
#[derive(Debug, Error)]
pub enum DetectorError {
    /// `detect`/`train` called before `initialize`
    #[error("detector not initialized")]
    NotInitialized,

    /// Operation attempted after shutdown began
    #[error("detector is shutting down or stopped")]
    ShutDown,

    /// One or more models failed to retrain; previous state kept
    #[error("training failed: {0}")]
    TrainingFailed(String),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    /// Processing queue closed before the item could be accepted
    #[error("processing queue closed")]
    QueueClosed,

    /// A spawned detection or queue task panicked or was cancelled
    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Errors raised by individual models
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model has not been trained")]
    NotTrained,

    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("feature dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("training sample {row} contains a non-finite value")]
    NonFiniteSample { row: usize },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors from encoding or decoding persisted state
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("payload is for {found}, expected {expected}")]
    TypeMismatch { expected: String, found: String },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T, E = DetectorError> = std::result::Result<T, E>;
