//! Virtual file store seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    /// Raw bytes of the content.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// Content as text, decoding binary data lossily.
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Binary(b) => String::from_utf8(b)
                .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()),
        }
    }

    /// Content as bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(s) => s.into_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// Whether there are no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for FileContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for FileContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

/// File store error.
#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Path-keyed store of text and binary files.
///
/// Paths are POSIX-style absolute strings. Writes create missing
/// parent directories implicitly.
#[async_trait]
pub trait VirtualFileStore: Send + Sync {
    /// Whether a file or directory exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool, FileStoreError>;

    /// Read a file, as bytes when `as_binary` is set.
    async fn read_file(&self, path: &str, as_binary: bool) -> Result<FileContent, FileStoreError>;

    /// Create or overwrite a file.
    async fn write_file(&self, path: &str, content: FileContent) -> Result<(), FileStoreError>;

    /// Create a directory (and its parents). Existing directories are fine.
    async fn create_directory(&self, path: &str) -> Result<(), FileStoreError>;

    /// Append to a file, creating it when absent.
    async fn append_file(&self, path: &str, content: FileContent) -> Result<(), FileStoreError> {
        let existing = if self.exists(path).await? {
            self.read_file(path, true).await?.into_bytes()
        } else {
            Vec::new()
        };
        let mut bytes = existing;
        bytes.extend_from_slice(content.as_bytes());
        let merged = match String::from_utf8(bytes) {
            Ok(text) => FileContent::Text(text),
            Err(e) => FileContent::Binary(e.into_bytes()),
        };
        self.write_file(path, merged).await
    }
}
