//! `JobStore`: the async persistence interface for jobs and Results.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{CredentialResult, Job, JobStatus};

/// Backend-agnostic persistence for jobs and per-credential Results.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert or replace a job record.
    async fn save_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Set a job's status and status message.
    ///
    /// Returns `DatabaseError::NotFound` when no such job exists.
    async fn set_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// All jobs that carry a schedule.
    async fn list_scheduled_jobs(&self) -> Result<Vec<Job>, DatabaseError>;

    /// Record when a scheduled job last fired.
    async fn mark_scheduled_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Move jobs left Running/Stopping by a previous process to Error.
    /// Returns how many were reset.
    async fn reset_interrupted_jobs(&self) -> Result<u64, DatabaseError>;

    /// Delete a job and all of its Results. Returns `false` when no such
    /// job existed.
    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Results ─────────────────────────────────────────────────────

    /// Insert or overwrite the Result for `(job_id, credential_identifier)`.
    async fn upsert_result(&self, result: &CredentialResult) -> Result<(), DatabaseError>;

    /// All Results of a job, in first-write order.
    async fn list_results(&self, job_id: Uuid) -> Result<Vec<CredentialResult>, DatabaseError>;

    /// Delete every Result of a job. Returns how many were removed.
    async fn delete_results(&self, job_id: Uuid) -> Result<u64, DatabaseError>;

    /// Delete one Result. Returns `false` when there was none.
    async fn delete_result(
        &self,
        job_id: Uuid,
        credential_identifier: &str,
    ) -> Result<bool, DatabaseError>;
}
