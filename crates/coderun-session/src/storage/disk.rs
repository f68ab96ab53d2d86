//! File store backed by a host directory.
//!
//! Virtual paths map onto `root` so a subprocess interpreter running in
//! `root` sees the same files the session writes.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use coderun_core::{FileContent, FileStoreError, VirtualFileStore, paths};
use tokio::{fs, io::AsyncWriteExt};

/// Host-directory file store.
#[derive(Debug, Clone)]
pub struct DiskFileStore {
    root: PathBuf,
}

impl DiskFileStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host location of a virtual path.
    ///
    /// # Errors
    /// Returns `InvalidPath` if the path has `..` segments.
    pub fn host_path(&self, path: &str) -> Result<PathBuf, FileStoreError> {
        let normalized = paths::normalize(path);
        let mut host = self.root.clone();
        for segment in normalized.split('/').filter(|s| !s.is_empty()) {
            if segment == ".." {
                return Err(FileStoreError::InvalidPath(path.to_owned()));
            }
            host.push(segment);
        }
        Ok(host)
    }

    async fn ensure_parent(host: &Path) -> Result<(), FileStoreError> {
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn not_found(path: &str, err: std::io::Error) -> FileStoreError {
    if err.kind() == ErrorKind::NotFound {
        FileStoreError::NotFound(path.to_owned())
    } else {
        FileStoreError::Io(err)
    }
}

#[async_trait]
impl VirtualFileStore for DiskFileStore {
    async fn exists(&self, path: &str) -> Result<bool, FileStoreError> {
        Ok(fs::try_exists(self.host_path(path)?).await?)
    }

    async fn read_file(&self, path: &str, as_binary: bool) -> Result<FileContent, FileStoreError> {
        let host = self.host_path(path)?;
        if fs::metadata(&host).await.map_err(|e| not_found(path, e))?.is_dir() {
            return Err(FileStoreError::InvalidPath(path.to_owned()));
        }
        let bytes = fs::read(&host).await.map_err(|e| not_found(path, e))?;
        if as_binary {
            return Ok(FileContent::Binary(bytes));
        }
        Ok(match String::from_utf8(bytes) {
            Ok(text) => FileContent::Text(text),
            Err(e) => FileContent::Binary(e.into_bytes()),
        })
    }

    async fn write_file(&self, path: &str, content: FileContent) -> Result<(), FileStoreError> {
        let host = self.host_path(path)?;
        Self::ensure_parent(&host).await?;
        fs::write(&host, content.as_bytes()).await?;
        tracing::trace!(path, bytes = content.as_bytes().len(), "File written");
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<(), FileStoreError> {
        fs::create_dir_all(self.host_path(path)?).await?;
        Ok(())
    }

    async fn append_file(&self, path: &str, content: FileContent) -> Result<(), FileStoreError> {
        let host = self.host_path(path)?;
        Self::ensure_parent(&host).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&host)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
