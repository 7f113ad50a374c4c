//! Worker-side writer for the Outcome Channel.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::OutcomeError;
use crate::outcome::files;
use crate::outcome::reader::{FileOutcomeReader, WorkerOutcome};
use crate::outcome::types::{
    Completion, CompletionStatus, CredentialEntry, ResultsManifest, WorkerErrorKind,
    WorkerErrorSignal,
};

/// Writes Outcome Channel documents into a scratch directory.
///
/// Every write goes to a hidden temp file first and is renamed into place,
/// so a reader never sees a partially written document.
pub struct OutcomeWriter {
    dir: PathBuf,
    progress_lock: Mutex<()>,
}

impl OutcomeWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            progress_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Upsert one credential's entry in `progress.json`.
    pub async fn record_progress(&self, entry: CredentialEntry) -> Result<(), OutcomeError> {
        let _guard = self.progress_lock.lock().await;

        let mut entries = FileOutcomeReader::new(&self.dir).progress().await?;
        match entries
            .iter_mut()
            .find(|e| e.credential_identifier == entry.credential_identifier)
        {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }

        self.write_json(files::PROGRESS, &entries).await
    }

    pub async fn write_completion(
        &self,
        status: CompletionStatus,
        message: impl Into<String>,
    ) -> Result<(), OutcomeError> {
        self.write_json(files::COMPLETION, &Completion::new(status, message))
            .await
    }

    pub async fn write_error(
        &self,
        kind: WorkerErrorKind,
        message: impl Into<String>,
        credential_identifier: Option<String>,
    ) -> Result<(), OutcomeError> {
        let signal = WorkerErrorSignal::new(kind, message, credential_identifier);
        self.write_json(files::ERROR, &signal).await
    }

    pub async fn write_results(&self, entries: Vec<CredentialEntry>) -> Result<(), OutcomeError> {
        self.write_json(files::RESULTS, &ResultsManifest::from_entries(entries))
            .await
    }

    async fn write_json<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), OutcomeError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| OutcomeError::Parse {
            file: name.to_string(),
            reason: e.to_string(),
        })?;

        let path = self.dir.join(name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| OutcomeError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| OutcomeError::Io { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ResultStatus;

    #[tokio::test]
    async fn progress_is_upserted_by_credential() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutcomeWriter::new(dir.path());

        writer
            .record_progress(CredentialEntry::failure("a", "timeout", 1, None))
            .await
            .unwrap();
        writer
            .record_progress(CredentialEntry::success("b", "bills/b.pdf", 1))
            .await
            .unwrap();
        writer
            .record_progress(CredentialEntry::success("a", "bills/a.pdf", 2))
            .await
            .unwrap();

        let progress = FileOutcomeReader::new(dir.path()).progress().await.unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].credential_identifier, "a");
        assert_eq!(progress[0].status, ResultStatus::Success);
        assert_eq!(progress[0].retry_attempts, 2);
    }

    #[tokio::test]
    async fn writes_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutcomeWriter::new(dir.path());

        writer
            .write_completion(CompletionStatus::Completed, "done")
            .await
            .unwrap();
        writer
            .write_error(WorkerErrorKind::DataError, "empty batch", None)
            .await
            .unwrap();
        writer
            .write_results(vec![CredentialEntry::success("a", "bills/a.pdf", 1)])
            .await
            .unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![files::COMPLETION, files::ERROR, files::RESULTS]
        );

        let reader = FileOutcomeReader::new(dir.path());
        let manifest = reader.results().await.unwrap().unwrap();
        assert_eq!(manifest.successful, 1);
        let error = reader.error().await.unwrap().unwrap();
        assert_eq!(error.kind, WorkerErrorKind::DataError);
    }
}
