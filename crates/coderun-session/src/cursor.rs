//! Demultiplexing of the remote data stream into files.

use std::collections::HashSet;

/// Where the next inbound data chunk belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Console text, possibly stdin for the local program.
    Console,
    /// Content for the named output file.
    File(String),
    /// Payload of a rejected header; dropped.
    Discard,
}

/// Rejected file header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("File {0} is not in the declared output manifest")]
    Unexpected(String),
    #[error("File {0} was already received")]
    Repeated(String),
}

/// Tracks which output file the data stream is currently filling.
///
/// `current`, when set, is a member of the manifest (if one was declared)
/// and is never a name the cursor already advanced past.
#[derive(Debug, Clone, Default)]
pub struct FileTransferCursor {
    expected: Vec<String>,
    current: Option<String>,
    passed: HashSet<String>,
    discarding: bool,
}

impl FileTransferCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the output files the service will send, in order.
    pub fn set_manifest<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected = names
            .into_iter()
            .map(Into::into)
            .filter(|name: &String| !name.is_empty())
            .collect();
    }

    #[must_use]
    pub fn manifest(&self) -> &[String] {
        &self.expected
    }

    #[must_use]
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Switch the data stream to `name`.
    ///
    /// # Errors
    /// Returns an error, and discards data until the next accepted header,
    /// if `name` is outside a non-empty manifest or was already received.
    pub fn advance(&mut self, name: &str) -> Result<(), HeaderError> {
        let rejected = if !self.expected.is_empty() && !self.expected.iter().any(|n| n == name) {
            Some(HeaderError::Unexpected(name.to_owned()))
        } else if self.passed.contains(name) || self.current.as_deref() == Some(name) {
            Some(HeaderError::Repeated(name.to_owned()))
        } else {
            None
        };

        self.discard();
        if let Some(error) = rejected {
            return Err(error);
        }
        self.discarding = false;
        self.current = Some(name.to_owned());
        Ok(())
    }

    /// Drop data until the next accepted header.
    pub fn discard(&mut self) {
        if let Some(previous) = self.current.take() {
            self.passed.insert(previous);
        }
        self.discarding = true;
    }

    /// Route for the next data chunk.
    #[must_use]
    pub fn route(&self) -> Route {
        match &self.current {
            Some(name) => Route::File(name.clone()),
            None if self.discarding => Route::Discard,
            None => Route::Console,
        }
    }

    /// Whether `name` is the final entry of the manifest.
    #[must_use]
    pub fn is_last(&self, name: &str) -> bool {
        self.expected.last().is_some_and(|last| last == name)
    }

    /// Forget everything; used when a session ends or a new one starts.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_until_header() {
        let mut cursor = FileTransferCursor::new();
        assert_eq!(cursor.route(), Route::Console);

        cursor.advance("a.txt").unwrap();
        assert_eq!(cursor.route(), Route::File("a.txt".into()));
        cursor.advance("b.txt").unwrap();
        assert_eq!(cursor.route(), Route::File("b.txt".into()));
    }

    #[test]
    fn test_names_never_repeat() {
        let mut cursor = FileTransferCursor::new();
        cursor.advance("a.txt").unwrap();
        cursor.advance("b.txt").unwrap();

        assert_eq!(
            cursor.advance("a.txt"),
            Err(HeaderError::Repeated("a.txt".into()))
        );
        assert_eq!(cursor.route(), Route::Discard);
        assert_eq!(cursor.current(), None);
    }

    #[test]
    fn test_manifest_membership() {
        let mut cursor = FileTransferCursor::new();
        cursor.set_manifest(["out.txt", "log.txt"]);

        assert!(cursor.advance("other.txt").is_err());
        assert_eq!(cursor.route(), Route::Discard);

        cursor.advance("out.txt").unwrap();
        assert!(!cursor.is_last("out.txt"));
        assert!(cursor.is_last("log.txt"));
    }

    #[test]
    fn test_empty_manifest_line_means_no_files() {
        let mut cursor = FileTransferCursor::new();
        cursor.set_manifest([""]);
        assert!(cursor.manifest().is_empty());
        assert!(!cursor.is_last(""));
    }

    #[test]
    fn test_reset() {
        let mut cursor = FileTransferCursor::new();
        cursor.set_manifest(["out.txt"]);
        cursor.advance("out.txt").unwrap();
        cursor.reset();

        assert_eq!(cursor.route(), Route::Console);
        assert!(cursor.manifest().is_empty());
        cursor.advance("out.txt").unwrap();
    }
}
