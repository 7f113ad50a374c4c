//! Job data model: job records, credential sources and per-credential results.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::state::JobStatus;
use crate::schedule::Schedule;

/// Credential identifier used for Results that describe the whole job
/// rather than one credential (spawn failure, timeout, crash, config error).
pub const JOB_LEVEL_IDENTIFIER: &str = "__job__";

/// Where the worker gets its batch of credentials from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CredentialSource {
    /// A file already on the supervisor's filesystem.
    Path(PathBuf),
    /// An object in artifact storage, fetched into the scratch directory.
    Object(String),
    /// A small inline JSON payload, written into the scratch directory.
    Inline(String),
}

/// What the trigger interface hands over to start a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub id: Uuid,
    pub credential_source: CredentialSource,
    pub login_url: String,
    pub target_url: String,
}

impl JobSpec {
    pub fn new(
        id: Uuid,
        credential_source: CredentialSource,
        login_url: impl Into<String>,
        target_url: impl Into<String>,
    ) -> Self {
        Self {
            id,
            credential_source,
            login_url: login_url.into(),
            target_url: target_url.into(),
        }
    }
}

/// A persisted batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub credential_source: CredentialSource,
    pub login_url: String,
    pub target_url: String,
    pub status: JobStatus,
    /// Human-readable reason for the current status, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Recurrence, for scheduled jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scheduled_run: Option<DateTime<Utc>>,
}

impl Job {
    /// Create an idle job from a spec.
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id,
            credential_source: spec.credential_source,
            login_url: spec.login_url,
            target_url: spec.target_url,
            status: JobStatus::Idle,
            status_message: None,
            schedule: None,
            created_at: now,
            updated_at: now,
            last_scheduled_run: None,
        }
    }

    /// Attach a recurrence.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// The trigger-level view of this job.
    pub fn spec(&self) -> JobSpec {
        JobSpec {
            id: self.id,
            credential_source: self.credential_source.clone(),
            login_url: self.login_url.clone(),
            target_url: self.target_url.clone(),
        }
    }
}

/// Outcome status of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            _ => Self::Error,
        }
    }
}

/// Durable outcome of processing one credential within one job.
///
/// Keyed by `(job_id, credential_identifier)`; writes are upserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialResult {
    pub job_id: Uuid,
    pub credential_identifier: String,
    pub status: ResultStatus,
    pub artifact_reference: Option<String>,
    pub error_message: Option<String>,
    pub retry_attempts: u32,
    pub final_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CredentialResult {
    /// A successful credential with its artifact.
    pub fn success(
        job_id: Uuid,
        credential_identifier: impl Into<String>,
        artifact_reference: impl Into<String>,
        retry_attempts: u32,
    ) -> Self {
        Self {
            job_id,
            credential_identifier: credential_identifier.into(),
            status: ResultStatus::Success,
            artifact_reference: Some(artifact_reference.into()),
            error_message: None,
            retry_attempts,
            final_error: None,
            created_at: Utc::now(),
        }
    }

    /// A failed credential.
    pub fn error(
        job_id: Uuid,
        credential_identifier: impl Into<String>,
        error_message: impl Into<String>,
        retry_attempts: u32,
    ) -> Self {
        Self {
            job_id,
            credential_identifier: credential_identifier.into(),
            status: ResultStatus::Error,
            artifact_reference: None,
            error_message: Some(error_message.into()),
            retry_attempts,
            final_error: None,
            created_at: Utc::now(),
        }
    }

    /// A job-level error (not tied to one credential).
    pub fn job_error(job_id: Uuid, error_message: impl Into<String>) -> Self {
        let message = error_message.into();
        Self {
            final_error: Some(message.clone()),
            ..Self::error(job_id, JOB_LEVEL_IDENTIFIER, message, 0)
        }
    }

    pub fn with_final_error(mut self, final_error: impl Into<String>) -> Self {
        self.final_error = Some(final_error.into());
        self
    }

    pub fn is_job_level(&self) -> bool {
        self.credential_identifier == JOB_LEVEL_IDENTIFIER
    }
}

/// What a finished supervisor run produced.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: Option<String>,
    /// Every Result committed during reconciliation, in commit order.
    pub results: Vec<CredentialResult>,
}

impl JobOutcome {
    /// Count of per-credential successes.
    pub fn successful(&self) -> usize {
        self.results
            .iter()
            .filter(|r| !r.is_job_level() && r.status == ResultStatus::Success)
            .count()
    }

    /// Count of per-credential failures (job-level errors excluded).
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| !r.is_job_level() && r.status == ResultStatus::Error)
            .count()
    }
}
