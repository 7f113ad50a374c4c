//! Artifact storage interface and a filesystem implementation.
//!
//! The supervisor only moves opaque references around: it downloads the
//! credential batch for `CredentialSource::Object`, and forwards whatever
//! reference the worker reports for each artifact.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::StorageError;

/// Object storage as seen by the supervisor and worker-side runner.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Store `bytes` under `name`, returning the reference to persist.
    async fn upload_artifact(&self, bytes: &[u8], name: &str) -> Result<String, StorageError>;

    /// Fetch the object behind `reference`.
    async fn download_object(&self, reference: &str) -> Result<Vec<u8>, StorageError>;
}

/// Objects stored as files under a root directory; references are paths
/// relative to that root.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a reference to a path, refusing anything that leaves the root.
    fn resolve(&self, reference: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(reference);
        let mut clean = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidReference(reference.to_string()));
                }
            }
        }
        if clean.as_os_str().is_empty() {
            return Err(StorageError::InvalidReference(reference.to_string()));
        }
        Ok(self.root.join(clean))
    }
}

#[async_trait]
impl ArtifactStorage for LocalStorage {
    async fn upload_artifact(&self, bytes: &[u8], name: &str) -> Result<String, StorageError> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(reference = name, bytes = bytes.len(), "Artifact stored");
        Ok(name.to_string())
    }

    async fn download_object(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(reference)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
