//! Error types for the task orchestration core.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Background task error: {0}")]
    Background(#[from] BackgroundError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Concurrency slot acquisition errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("timed out waiting for concurrency slot '{key}' after {waited:?}")]
    Timeout { key: String, waited: Duration },

    #[error("concurrency slot '{key}' was closed while waiting")]
    Closed { key: String },
}

/// Worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Unknown worker: {id}")]
    UnknownProfile { id: String },

    #[error("Auto-spawn not configured for worker {id}")]
    SpawnNotConfigured { id: String },

    #[error("Failed to start worker {id}: {reason}")]
    SpawnFailed { id: String, reason: String },

    #[error("Worker {id} did not become ready within {timeout:?}")]
    SpawnTimeout { id: String, timeout: Duration },

    #[error("Failed to stop worker {id}: {reason}")]
    StopFailed { id: String, reason: String },
}

/// External session API errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session API returned no data for {operation}")]
    NoData { operation: String },

    #[error("Session API {operation} failed: {reason}")]
    RequestFailed { operation: String, reason: String },
}

/// Background task errors.
#[derive(Debug, thiserror::Error)]
pub enum BackgroundError {
    #[error("Background task {id} not found")]
    NotFound { id: Uuid },

    #[error("Background task {id} is not owned by session {session_id}")]
    Forbidden { id: Uuid, session_id: String },

    #[error("Background task {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: String },

    #[error("Background manager has been shut down")]
    ShutDown,

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
