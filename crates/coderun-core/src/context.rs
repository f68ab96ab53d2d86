//! Per-project session context.

use std::sync::Arc;

use crate::{ConsoleSink, FileStoreError, ProjectConfig, VirtualFileStore, paths};

/// Everything a session needs to know about the opened project.
///
/// Constructed once per opened project and passed to the multiplexer,
/// instead of being looked up from shared global state.
#[derive(Clone)]
pub struct ProjectContext {
    /// Project settings, read at run/connect time.
    pub config: ProjectConfig,
    /// File store holding the project's sources and attachments.
    pub files: Arc<dyn VirtualFileStore>,
    /// Console the session reports to.
    pub console: Arc<dyn ConsoleSink>,
}

impl ProjectContext {
    /// Create a context from its parts.
    #[must_use]
    pub fn new(
        config: ProjectConfig,
        files: Arc<dyn VirtualFileStore>,
        console: Arc<dyn ConsoleSink>,
    ) -> Self {
        Self {
            config,
            files,
            console,
        }
    }

    /// Path of `name` under the attachment root.
    ///
    /// # Errors
    /// Returns `InvalidPath` if `name` would escape the root.
    pub fn attachment_path(&self, name: &str) -> Result<String, FileStoreError> {
        paths::join_under(&self.config.dir_attachments, name)
    }
}

impl std::fmt::Debug for ProjectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
