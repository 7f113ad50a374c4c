//! Outcome Channel: the file protocol between the supervisor and a worker.
//!
//! The worker writes JSON documents into its job-scoped scratch directory;
//! the supervisor reads them after the worker exits. Every document is
//! optional (absent means "no signal"), carries a schema `version`, and is
//! written atomically by `OutcomeWriter` (temp file + rename).

pub mod reader;
pub mod types;
pub mod writer;

pub use reader::{FileOutcomeReader, WorkerOutcome};
pub use types::{
    Completion, CompletionStatus, CredentialEntry, ResultsManifest, WorkerErrorKind,
    WorkerErrorSignal,
};
pub use writer::OutcomeWriter;

/// Highest document schema version this build understands.
pub const SCHEMA_VERSION: u32 = 1;

/// File names inside the scratch directory.
pub mod files {
    pub const COMPLETION: &str = "completion.json";
    pub const ERROR: &str = "error.json";
    pub const RESULTS: &str = "results.json";
    pub const PROGRESS: &str = "progress.json";
}

/// Environment variables the supervisor hands to a worker.
pub mod env {
    pub const JOB_ID: &str = "WORKER_JOB_ID";
    pub const SCRATCH_DIR: &str = "WORKER_SCRATCH_DIR";
    pub const CREDENTIALS_PATH: &str = "WORKER_CREDENTIALS_PATH";
    pub const LOGIN_URL: &str = "WORKER_LOGIN_URL";
    pub const TARGET_URL: &str = "WORKER_TARGET_URL";
    pub const MAX_ATTEMPTS: &str = "WORKER_MAX_ATTEMPTS";
    pub const BACKOFF_BASE_MS: &str = "WORKER_BACKOFF_BASE_MS";
    pub const BACKOFF_CAP_SECS: &str = "WORKER_BACKOFF_CAP_SECS";
}
