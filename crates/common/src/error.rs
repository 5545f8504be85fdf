//! Error types for Specter

use thiserror::Error;

/// Result type alias using the Specter Error
pub type Result<T> = std::result::Result<T, Error>;

/// Specter error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate test id: {id}")]
    DuplicateTest { id: String },

    #[error("Test extraction failed: {0}")]
    Extraction(String),

    #[error("Worker {worker_id} crashed")]
    WorkerCrash { worker_id: u32 },

    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(String),

    #[error("Retry budget exhausted for test {id}")]
    RetryExhausted { id: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Test not found: {id}")]
    UnknownTest { id: String },

    #[error("Worker {worker_id} is not idle")]
    WorkerNotIdle { worker_id: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Screenshot capture failed: {0}")]
    Capture(String),

    #[error("Screenshot comparison failed: {0}")]
    Compare(String),

    #[error("Expected image not found: {0}")]
    ExpectedImageMissing(String),

    #[error("Session is not accepting commands")]
    SessionClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}
