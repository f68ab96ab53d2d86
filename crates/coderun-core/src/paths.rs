//! POSIX-style path helpers for the virtual file store.

use crate::FileStoreError;

/// Join `name` under `root`, producing an absolute path.
///
/// `name` is interpreted relative to `root` even when it starts with `/`.
/// Empty and `.` segments are dropped; `..` is rejected so remote names
/// cannot escape the root.
///
/// # Errors
/// Returns `InvalidPath` if `name` is empty or contains `..`.
pub fn join_under(root: &str, name: &str) -> Result<String, FileStoreError> {
    let mut segments = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(FileStoreError::InvalidPath(name.to_owned())),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(FileStoreError::InvalidPath(name.to_owned()));
    }

    let root = normalize(root);
    let mut joined = root.trim_end_matches('/').to_owned();
    for segment in segments {
        joined.push('/');
        joined.push_str(segment);
    }
    Ok(joined)
}

/// Normalize a path to absolute form without duplicate or trailing slashes.
#[must_use]
pub fn normalize(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Parent directory of a normalized path, or `None` for the root.
#[must_use]
pub fn parent(path: &str) -> Option<String> {
    let path = normalize(path);
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_owned()),
        Some(idx) => Some(path[..idx].to_owned()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_under_attachment_root() {
        assert_eq!(join_under("/data/", "out.txt").unwrap(), "/data/out.txt");
        assert_eq!(join_under("/data", "/sub/x.bin").unwrap(), "/data/sub/x.bin");
        assert_eq!(join_under("/", "a//b").unwrap(), "/a/b");
    }

    #[test]
    fn test_join_rejects_escape() {
        assert!(join_under("/data/", "../etc/passwd").is_err());
        assert!(join_under("/data/", "").is_err());
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("/data/out.txt").as_deref(), Some("/data"));
        assert_eq!(parent("/main.py").as_deref(), Some("/"));
        assert_eq!(parent("/"), None);
    }
}
