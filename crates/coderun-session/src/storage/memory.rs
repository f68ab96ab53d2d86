//! In-memory virtual file store.

use std::{collections::BTreeMap, sync::RwLock};

use async_trait::async_trait;
use coderun_core::{FileContent, FileStoreError, VirtualFileStore, paths};

#[derive(Debug, Clone)]
enum Node {
    File(FileContent),
    Directory,
}

/// In-memory file store.
///
/// Useful for browser-style sandboxes and tests.
/// Data is lost on restart.
pub struct MemoryFileStore {
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl MemoryFileStore {
    /// Create a store containing only the root directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::from([("/".to_owned(), Node::Directory)])),
        }
    }

    /// Paths of all stored files, sorted.
    ///
    /// # Errors
    /// Returns error if the store lock is poisoned.
    pub fn list_files(&self) -> Result<Vec<String>, FileStoreError> {
        Ok(self
            .nodes
            .read()
            .map_err(|e| FileStoreError::Internal(e.to_string()))?
            .iter()
            .filter(|(_, node)| matches!(node, Node::File(_)))
            .map(|(path, _)| path.clone())
            .collect())
    }
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_parents(nodes: &mut BTreeMap<String, Node>, path: &str) -> Result<(), FileStoreError> {
    let mut current = paths::parent(path);
    while let Some(dir) = current {
        match nodes.get(&dir) {
            Some(Node::Directory) => break,
            Some(Node::File(_)) => return Err(FileStoreError::InvalidPath(dir)),
            None => {
                current = paths::parent(&dir);
                nodes.insert(dir, Node::Directory);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl VirtualFileStore for MemoryFileStore {
    async fn exists(&self, path: &str) -> Result<bool, FileStoreError> {
        Ok(self
            .nodes
            .read()
            .map_err(|e| FileStoreError::Internal(e.to_string()))?
            .contains_key(&paths::normalize(path)))
    }

    async fn read_file(&self, path: &str, as_binary: bool) -> Result<FileContent, FileStoreError> {
        let path = paths::normalize(path);
        let nodes = self
            .nodes
            .read()
            .map_err(|e| FileStoreError::Internal(e.to_string()))?;

        match nodes.get(&path) {
            Some(Node::File(content)) if as_binary => Ok(FileContent::Binary(content.as_bytes().to_vec())),
            Some(Node::File(content)) => Ok(FileContent::Text(content.clone().into_text())),
            Some(Node::Directory) => Err(FileStoreError::InvalidPath(path)),
            None => Err(FileStoreError::NotFound(path)),
        }
    }

    async fn write_file(&self, path: &str, content: FileContent) -> Result<(), FileStoreError> {
        let path = paths::normalize(path);
        let mut nodes = self
            .nodes
            .write()
            .map_err(|e| FileStoreError::Internal(e.to_string()))?;

        if matches!(nodes.get(&path), Some(Node::Directory)) {
            return Err(FileStoreError::InvalidPath(path));
        }
        insert_parents(&mut nodes, &path)?;
        nodes.insert(path, Node::File(content));
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<(), FileStoreError> {
        let path = paths::normalize(path);
        let mut nodes = self
            .nodes
            .write()
            .map_err(|e| FileStoreError::Internal(e.to_string()))?;

        match nodes.get(&path) {
            Some(Node::Directory) => Ok(()),
            Some(Node::File(_)) => Err(FileStoreError::InvalidPath(path)),
            None => {
                insert_parents(&mut nodes, &path)?;
                nodes.insert(path, Node::Directory);
                Ok(())
            }
        }
    }

    async fn append_file(&self, path: &str, content: FileContent) -> Result<(), FileStoreError> {
        let path = paths::normalize(path);
        let mut nodes = self
            .nodes
            .write()
            .map_err(|e| FileStoreError::Internal(e.to_string()))?;

        let merged = match nodes.get(&path) {
            Some(Node::Directory) => return Err(FileStoreError::InvalidPath(path)),
            Some(Node::File(FileContent::Text(existing))) => match content {
                FileContent::Text(more) => FileContent::Text(format!("{existing}{more}")),
                FileContent::Binary(more) => {
                    let mut bytes = existing.clone().into_bytes();
                    bytes.extend_from_slice(&more);
                    FileContent::Binary(bytes)
                }
            },
            Some(Node::File(FileContent::Binary(existing))) => {
                let mut bytes = existing.clone();
                bytes.extend_from_slice(content.as_bytes());
                FileContent::Binary(bytes)
            }
            None => {
                insert_parents(&mut nodes, &path)?;
                content
            }
        };
        nodes.insert(path, Node::File(merged));
        Ok(())
    }
}
