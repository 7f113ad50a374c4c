//! Reading the Outcome Channel.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::OutcomeError;
use crate::outcome::types::{
    Completion, CredentialEntry, ResultsManifest, Versioned, WorkerErrorSignal,
};
use crate::outcome::{SCHEMA_VERSION, files};

/// Source of the signals a finished worker left behind.
///
/// `Ok(None)` / an empty progress list means the worker never wrote that
/// signal. The aggregator only talks to this trait, so the transport can
/// change without touching reconciliation.
#[async_trait]
pub trait WorkerOutcome: Send + Sync {
    /// Real-time per-credential progress, in the order the worker wrote it.
    async fn progress(&self) -> Result<Vec<CredentialEntry>, OutcomeError>;

    async fn completion(&self) -> Result<Option<Completion>, OutcomeError>;

    async fn error(&self) -> Result<Option<WorkerErrorSignal>, OutcomeError>;

    async fn results(&self) -> Result<Option<ResultsManifest>, OutcomeError>;
}

/// Reads the Outcome Channel files from a scratch directory.
#[derive(Debug, Clone)]
pub struct FileOutcomeReader {
    dir: PathBuf,
}

impl FileOutcomeReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_raw(&self, name: &str) -> Result<Option<Vec<u8>>, OutcomeError> {
        let path = self.dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(OutcomeError::Io { path, source }),
        }
    }

    async fn read_document<T>(&self, name: &str) -> Result<Option<T>, OutcomeError>
    where
        T: DeserializeOwned + Versioned,
    {
        let Some(bytes) = self.read_raw(name).await? else {
            return Ok(None);
        };
        let document: T = parse(name, &bytes)?;
        check_version(name, &document)?;
        Ok(Some(document))
    }
}

fn parse<T: DeserializeOwned>(name: &str, bytes: &[u8]) -> Result<T, OutcomeError> {
    serde_json::from_slice(bytes).map_err(|e| OutcomeError::Parse {
        file: name.to_string(),
        reason: e.to_string(),
    })
}

fn check_version<T: Versioned>(name: &str, document: &T) -> Result<(), OutcomeError> {
    if document.version() > SCHEMA_VERSION {
        return Err(OutcomeError::UnsupportedVersion {
            file: name.to_string(),
            version: document.version(),
        });
    }
    Ok(())
}

#[async_trait]
impl WorkerOutcome for FileOutcomeReader {
    async fn progress(&self) -> Result<Vec<CredentialEntry>, OutcomeError> {
        let Some(bytes) = self.read_raw(files::PROGRESS).await? else {
            return Ok(Vec::new());
        };
        let entries: Vec<CredentialEntry> = parse(files::PROGRESS, &bytes)?;
        for entry in &entries {
            check_version(files::PROGRESS, entry)?;
        }
        Ok(entries)
    }

    async fn completion(&self) -> Result<Option<Completion>, OutcomeError> {
        self.read_document(files::COMPLETION).await
    }

    async fn error(&self) -> Result<Option<WorkerErrorSignal>, OutcomeError> {
        self.read_document(files::ERROR).await
    }

    async fn results(&self) -> Result<Option<ResultsManifest>, OutcomeError> {
        self.read_document(files::RESULTS).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::types::CompletionStatus;

    #[tokio::test]
    async fn missing_files_mean_no_signal() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FileOutcomeReader::new(dir.path());

        assert!(reader.progress().await.unwrap().is_empty());
        assert!(reader.completion().await.unwrap().is_none());
        assert!(reader.error().await.unwrap().is_none());
        assert!(reader.results().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_worker_written_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(files::COMPLETION),
            r#"{"version": 1, "status": "interrupted", "message": "stop requested"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join(files::PROGRESS),
            r#"[
                {"credential_identifier": "a", "status": "success", "artifact_reference": "bills/a.pdf", "retry_attempts": 1},
                {"credential_identifier": "b", "status": "error", "error": "bad password", "retry_attempts": 3}
            ]"#,
        )
        .unwrap();

        let reader = FileOutcomeReader::new(dir.path());
        let completion = reader.completion().await.unwrap().unwrap();
        assert_eq!(completion.status, CompletionStatus::Interrupted);

        let progress = reader.progress().await.unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[1].error.as_deref(), Some("bad password"));
    }

    #[tokio::test]
    async fn malformed_document_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(files::ERROR), "{not json").unwrap();

        let err = FileOutcomeReader::new(dir.path()).error().await.unwrap_err();
        assert!(matches!(err, OutcomeError::Parse { ref file, .. } if file == files::ERROR));
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(files::COMPLETION),
            r#"{"version": 2, "status": "completed"}"#,
        )
        .unwrap();

        let err = FileOutcomeReader::new(dir.path())
            .completion()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OutcomeError::UnsupportedVersion { version: 2, .. }
        ));
    }

    #[tokio::test]
    async fn empty_file_is_no_signal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(files::RESULTS), "").unwrap();
        assert!(
            FileOutcomeReader::new(dir.path())
                .results()
                .await
                .unwrap()
                .is_none()
        );
    }
}
