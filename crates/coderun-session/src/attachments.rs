//! Bulk import of unpacked archive entries under the attachment root.

use coderun_core::{FileContent, FileStoreError, ProjectContext};
use serde::{Deserialize, Serialize};

/// A file from an unpacked archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentFile {
    /// Path relative to the attachment root.
    pub path: String,
    pub content: FileContent,
}

/// Folders and files produced by unpacking an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentBundle {
    pub folders: Vec<String>,
    pub files: Vec<AttachmentFile>,
}

impl AttachmentBundle {
    /// Write the bundle into the project's file store.
    ///
    /// All folders are created before any file is written. Existing files
    /// are overwritten.
    ///
    /// # Errors
    /// Returns the first path or store error; entries before it stay written.
    pub async fn import(self, ctx: &ProjectContext) -> Result<usize, FileStoreError> {
        for folder in &self.folders {
            let path = ctx.attachment_path(folder)?;
            ctx.files.create_directory(&path).await?;
        }

        let count = self.files.len();
        for file in self.files {
            let path = ctx.attachment_path(&file.path)?;
            tracing::debug!(%path, "Importing attachment");
            ctx.files.write_file(&path, file.content).await?;
        }
        tracing::info!(
            folders = self.folders.len(),
            files = count,
            root = %ctx.config.dir_attachments,
            "Attachments imported"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use coderun_core::{ConsoleLog, ProjectConfig, VirtualFileStore};

    use super::*;
    use crate::storage::MemoryFileStore;

    fn context(files: Arc<MemoryFileStore>) -> ProjectContext {
        ProjectContext::new(ProjectConfig::default(), files, Arc::new(ConsoleLog::new()))
    }

    #[tokio::test]
    async fn test_import_under_attachment_root() {
        let files = Arc::new(MemoryFileStore::new());
        let bundle = AttachmentBundle {
            folders: vec!["inputs".into(), "inputs/large".into()],
            files: vec![
                AttachmentFile {
                    path: "inputs/large/1.txt".into(),
                    content: "1 2".into(),
                },
                AttachmentFile {
                    path: "readme.md".into(),
                    content: "hi".into(),
                },
            ],
        };

        let count = bundle.import(&context(Arc::clone(&files))).await.unwrap();

        assert_eq!(count, 2);
        assert!(files.exists("/data/inputs/large").await.unwrap());
        assert_eq!(
            files.read_file("/data/inputs/large/1.txt", false).await.unwrap(),
            FileContent::Text("1 2".into())
        );
        assert!(files.exists("/data/readme.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let files = Arc::new(MemoryFileStore::new());
        let bundle = AttachmentBundle {
            folders: Vec::new(),
            files: vec![
                AttachmentFile {
                    path: "a".into(),
                    content: "first".into(),
                },
                AttachmentFile {
                    path: "a".into(),
                    content: "second".into(),
                },
            ],
        };
        bundle.import(&context(Arc::clone(&files))).await.unwrap();
        assert_eq!(
            files.read_file("/data/a", false).await.unwrap().into_text(),
            "second"
        );
    }

    #[tokio::test]
    async fn test_rejects_escaping_entries() {
        let files = Arc::new(MemoryFileStore::new());
        let bundle = AttachmentBundle {
            folders: vec!["../etc".into()],
            files: Vec::new(),
        };
        assert!(bundle.import(&context(files)).await.is_err());
    }
}
