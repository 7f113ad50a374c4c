//! Job-scoped scratch directories.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::SupervisorError;

/// Directory name prefix; the rest of the name is the job id.
pub const SCRATCH_PREFIX: &str = "job_";

/// A scratch directory exclusively owned by one supervisor run.
///
/// Deleted by `release`, or on drop if the owner never got that far.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    released: bool,
}

impl ScratchDir {
    /// Create a fresh directory for `job_id` under `root`, replacing any
    /// leftover from an earlier run of the same job.
    pub async fn create(root: &Path, job_id: Uuid) -> Result<Self, SupervisorError> {
        let path = root.join(format!("{SCRATCH_PREFIX}{job_id}"));
        let to_error = |source| SupervisorError::Scratch {
            path: path.clone(),
            source,
        };

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => tracing::debug!(job_id = %job_id, "Replaced stale scratch directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(to_error(e)),
        }
        tokio::fs::create_dir_all(&path).await.map_err(to_error)?;

        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the directory and everything in it.
    pub async fn release(mut self) {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Scratch directory released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                "Failed to release scratch directory: {}", e
            ),
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_replaces_leftovers_and_release_deletes() {
        let root = tempfile::tempdir().unwrap();
        let job_id = Uuid::new_v4();

        let first = ScratchDir::create(root.path(), job_id).await.unwrap();
        std::fs::write(first.path().join("completion.json"), "{}").unwrap();
        std::mem::forget(first);

        let scratch = ScratchDir::create(root.path(), job_id).await.unwrap();
        assert!(scratch.path().exists());
        assert!(!scratch.path().join("completion.json").exists());

        let path = scratch.path().to_path_buf();
        scratch.release().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropped_scratch_is_removed() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let scratch = ScratchDir::create(root.path(), Uuid::new_v4()).await.unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
