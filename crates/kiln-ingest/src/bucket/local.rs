use super::{BlobBackend, BlobKey, Result, StorageError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Bucket rooted at a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, key: &BlobKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent.display(), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobBackend for LocalBackend {
    async fn put(&self, key: &BlobKey, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_of(key);
        Self::ensure_parent(&path).await?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::io(path.display(), e))
    }

    async fn append(&self, key: &BlobKey, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_of(key);
        Self::ensure_parent(&path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(path.display(), e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| StorageError::io(path.display(), e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::io(path.display(), e))
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>> {
        let path = self.path_of(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            },
            Err(e) => Err(StorageError::io(path.display(), e)),
        }
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool> {
        let path = self.path_of(key);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(path.display(), e))
    }

    fn locate(&self, key: &BlobKey) -> String {
        self.path_of(key).display().to_string()
    }
}
