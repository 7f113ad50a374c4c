//! Error types for the batch supervisor.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Outcome channel error: {0}")]
    Outcome(#[from] OutcomeError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Object storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object reference: {0}")]
    InvalidReference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the worker process lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The worker binary could not be started. Fatal to the job, never retried.
    #[error("Failed to spawn worker {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("worker timed out after {}s", timeout.as_secs())]
    Timeout { timeout: Duration },

    #[error("Scratch directory {path} unavailable: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reading or writing Outcome Channel documents.
#[derive(Debug, thiserror::Error)]
pub enum OutcomeError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed {file}: {reason}")]
    Parse { file: String, reason: String },

    #[error("Unsupported {file} schema version {version}")]
    UnsupportedVersion { file: String, version: u32 },
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Maximum parallel jobs ({max}) exceeded")]
    MaxJobsExceeded { max: usize },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Result type alias for the supervisor.
pub type Result<T> = std::result::Result<T, Error>;
