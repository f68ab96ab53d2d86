//! Project settings document.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{FileContent, FileStoreError, VirtualFileStore, paths};

/// Project settings, stored as JSON inside the project's file store.
///
/// Unknown keys are ignored and missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ProjectConfig {
    /// Entry point executed by a run.
    pub run: String,
    pub debug: bool,
    pub project_name: String,
    pub preferred_lang: String,

    /// Remote service endpoint used on connect.
    pub server: String,
    /// Known endpoints offered for selection.
    pub servers: Vec<String>,
    pub problem: String,
    pub service: String,
    /// Opaque auth token; empty means none.
    pub token: String,
    pub connect_timeout_secs: u64,

    pub dir_project: String,
    /// Root under which problem and remote files are stored.
    pub dir_attachments: String,
    pub dir_results: String,
    pub dir_argsfile: String,
    pub dir_examples: String,
    pub create_examples: bool,

    pub config_name: String,

    /// Additional interpreter packages the project depends on.
    pub extra_packages: Vec<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            run: "/main.py".to_owned(),
            debug: false,
            project_name: "My solution".to_owned(),
            preferred_lang: "en".to_owned(),
            server: "ws://localhost:8008/".to_owned(),
            servers: vec!["ws://localhost:8008/".to_owned()],
            problem: String::new(),
            service: String::new(),
            token: String::new(),
            connect_timeout_secs: 10,
            dir_project: "/.coderun/".to_owned(),
            dir_attachments: "/data/".to_owned(),
            dir_results: "/results/".to_owned(),
            dir_argsfile: "/files/".to_owned(),
            dir_examples: "/examples/".to_owned(),
            create_examples: true,
            config_name: "coderun.json".to_owned(),
            extra_packages: Vec::new(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Store error: {0}")]
    Store(#[from] FileStoreError),
    #[error("Invalid config document: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProjectConfig {
    /// Location of the settings document with the default layout.
    #[must_use]
    pub fn default_path() -> String {
        Self::default().config_path()
    }

    /// Location of this settings document.
    #[must_use]
    pub fn config_path(&self) -> String {
        paths::join_under(&self.dir_project, &self.config_name)
            .unwrap_or_else(|_| paths::normalize(&format!("{}/{}", self.dir_project, self.config_name)))
    }

    /// Token to present to the remote service, if any.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        Some(self.token.as_str()).filter(|t| !t.is_empty())
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Load the settings document at `path` (or the default location).
    ///
    /// Returns `Ok(None)` when no document exists.
    ///
    /// # Errors
    /// Returns error if the store fails or the document is not valid JSON.
    pub async fn load(
        fs: &dyn VirtualFileStore,
        path: Option<&str>,
    ) -> Result<Option<Self>, ConfigError> {
        let path = path.map_or_else(Self::default_path, str::to_owned);
        if !fs.exists(&path).await? {
            tracing::info!(%path, "Project config does not exist");
            return Ok(None);
        }
        let content = fs.read_file(&path, false).await?.into_text();
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write this document to its configured location.
    ///
    /// # Errors
    /// Returns error if serialization or the write fails.
    pub async fn save(&self, fs: &dyn VirtualFileStore) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs.write_file(&self.config_path(), FileContent::Text(content))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: ProjectConfig =
            serde_json::from_str(r#"{"RUN": "/app.py", "TOKEN": "abc", "HOTKEY_RUN": "f8"}"#)
                .unwrap();
        assert_eq!(config.run, "/app.py");
        assert_eq!(config.token(), Some("abc"));
        assert_eq!(config.dir_attachments, "/data/");
    }

    #[test]
    fn test_empty_token_is_none() {
        assert_eq!(ProjectConfig::default().token(), None);
    }

    #[test]
    fn test_config_path() {
        assert_eq!(ProjectConfig::default_path(), "/.coderun/coderun.json");
    }

    #[test]
    fn test_keys_are_screaming_snake_case() {
        let json = serde_json::to_value(ProjectConfig::default()).unwrap();
        assert!(json.get("DIR_ATTACHMENTS").is_some());
        assert!(json.get("EXTRA_PACKAGES").is_some());
    }
}
