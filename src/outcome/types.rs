//! Versioned JSON schemas of the Outcome Channel documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{CredentialResult, ResultStatus};
use crate::outcome::SCHEMA_VERSION;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

/// A document that declares its schema version.
pub trait Versioned {
    fn version(&self) -> u32;
}

/// Overall disposition the worker reports when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    CompletedWithError,
    Interrupted,
}

/// `completion.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    #[serde(default = "schema_version")]
    pub version: u32,
    pub status: CompletionStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Completion {
    pub fn new(status: CompletionStatus, message: impl Into<String>) -> Self {
        Self {
            version: SCHEMA_VERSION,
            status,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Category of a fatal or credential-scoped worker error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    /// Bad worker environment or settings.
    #[serde(alias = "env_error")]
    ConfigError,
    /// Malformed credential input.
    #[serde(alias = "csv_error")]
    DataError,
    /// One credential (or the loop around it) failed.
    ProcessingError,
    /// Anything else the worker could not recover from.
    CriticalError,
}

impl WorkerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigError => "config_error",
            Self::DataError => "data_error",
            Self::ProcessingError => "processing_error",
            Self::CriticalError => "critical_error",
        }
    }

    /// Whether this error fails the whole job regardless of exit code.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ProcessingError)
    }
}

/// `error.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerErrorSignal {
    #[serde(default = "schema_version")]
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: WorkerErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_identifier: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WorkerErrorSignal {
    pub fn new(
        kind: WorkerErrorKind,
        message: impl Into<String>,
        credential_identifier: Option<String>,
    ) -> Self {
        Self {
            version: SCHEMA_VERSION,
            kind,
            message: message.into(),
            credential_identifier,
            timestamp: Utc::now(),
        }
    }
}

/// One credential's outcome, as found in `progress.json` and `results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialEntry {
    #[serde(default = "schema_version")]
    pub version: u32,
    pub credential_identifier: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_error: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl CredentialEntry {
    pub fn success(
        credential_identifier: impl Into<String>,
        artifact_reference: impl Into<String>,
        retry_attempts: u32,
    ) -> Self {
        Self {
            version: SCHEMA_VERSION,
            credential_identifier: credential_identifier.into(),
            status: ResultStatus::Success,
            artifact_reference: Some(artifact_reference.into()),
            error: None,
            retry_attempts,
            final_error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        credential_identifier: impl Into<String>,
        error: impl Into<String>,
        retry_attempts: u32,
        final_error: Option<String>,
    ) -> Self {
        Self {
            version: SCHEMA_VERSION,
            credential_identifier: credential_identifier.into(),
            status: ResultStatus::Error,
            artifact_reference: None,
            error: Some(error.into()),
            retry_attempts,
            final_error,
            timestamp: Utc::now(),
        }
    }

    /// Convert into a durable Result. A success without an artifact does
    /// not meet the success criterion and becomes an error.
    pub fn to_result(&self, job_id: Uuid) -> CredentialResult {
        match (self.status, self.artifact_reference.as_deref()) {
            (ResultStatus::Success, Some(artifact)) if !artifact.is_empty() => {
                CredentialResult::success(
                    job_id,
                    &self.credential_identifier,
                    artifact,
                    self.retry_attempts,
                )
            }
            (ResultStatus::Success, _) => CredentialResult::error(
                job_id,
                &self.credential_identifier,
                "no artifact produced",
                self.retry_attempts,
            ),
            (ResultStatus::Error, _) => {
                let message = self
                    .error
                    .clone()
                    .or_else(|| self.final_error.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                let result = CredentialResult::error(
                    job_id,
                    &self.credential_identifier,
                    message,
                    self.retry_attempts,
                );
                match &self.final_error {
                    Some(final_error) => result.with_final_error(final_error),
                    None => result,
                }
            }
        }
    }
}

/// `results.json`: the final manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsManifest {
    #[serde(default = "schema_version")]
    pub version: u32,
    pub results: Vec<CredentialEntry>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub successful: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ResultsManifest {
    /// Build a manifest, deriving the counters from the entries.
    pub fn from_entries(results: Vec<CredentialEntry>) -> Self {
        let successful = results
            .iter()
            .filter(|r| r.status == ResultStatus::Success)
            .count();
        Self {
            version: SCHEMA_VERSION,
            total: results.len(),
            successful,
            failed: results.len() - successful,
            results,
            timestamp: Utc::now(),
        }
    }
}

impl Versioned for Completion {
    fn version(&self) -> u32 {
        self.version
    }
}

impl Versioned for WorkerErrorSignal {
    fn version(&self) -> u32 {
        self.version
    }
}

impl Versioned for CredentialEntry {
    fn version(&self) -> u32 {
        self.version
    }
}

impl Versioned for ResultsManifest {
    fn version(&self) -> u32 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_accepts_minimal_document() {
        let completion: Completion =
            serde_json::from_str(r#"{"status": "completed_with_error"}"#).unwrap();
        assert_eq!(completion.version, SCHEMA_VERSION);
        assert_eq!(completion.status, CompletionStatus::CompletedWithError);
        assert!(completion.message.is_empty());
    }

    #[test]
    fn error_kind_accepts_legacy_names() {
        let signal: WorkerErrorSignal =
            serde_json::from_str(r#"{"type": "csv_error", "message": "bad header"}"#).unwrap();
        assert_eq!(signal.kind, WorkerErrorKind::DataError);
        assert!(signal.kind.is_fatal());

        let json = serde_json::to_value(WorkerErrorSignal::new(
            WorkerErrorKind::ProcessingError,
            "login rejected",
            Some("a@example.com".into()),
        ))
        .unwrap();
        assert_eq!(json["type"], "processing_error");
        assert_eq!(json["credential_identifier"], "a@example.com");
    }

    #[test]
    fn success_without_artifact_becomes_error() {
        let job_id = Uuid::new_v4();
        let mut entry = CredentialEntry::success("a@example.com", "", 1);
        let result = entry.to_result(job_id);
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.error_message.as_deref(), Some("no artifact produced"));

        entry.artifact_reference = Some("bills/a.pdf".into());
        let result = entry.to_result(job_id);
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.artifact_reference.as_deref(), Some("bills/a.pdf"));
    }

    #[test]
    fn failed_entry_keeps_final_error() {
        let entry = CredentialEntry::failure(
            "b@example.com",
            "timeout",
            3,
            Some("Failed after 3 attempts: timeout".into()),
        );
        let result = entry.to_result(Uuid::new_v4());
        assert_eq!(result.retry_attempts, 3);
        assert_eq!(
            result.final_error.as_deref(),
            Some("Failed after 3 attempts: timeout")
        );
    }

    #[test]
    fn manifest_counts() {
        let manifest = ResultsManifest::from_entries(vec![
            CredentialEntry::success("a", "bills/a.pdf", 1),
            CredentialEntry::failure("b", "nope", 2, None),
            CredentialEntry::success("c", "bills/c.pdf", 1),
        ]);
        assert_eq!(manifest.total, 3);
        assert_eq!(manifest.successful, 2);
        assert_eq!(manifest.failed, 1);
    }
}
