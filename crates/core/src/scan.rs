//! Directory scanning via the `ignore` crate's walker
//!
//! Produces the set of currently-present files with their fingerprint, size,
//! and modification time. Hidden (dot-prefixed) files, the state document
//! itself, configured ignore globs, and symlinks are all skipped. Paths are
//! normalized to forward-slash form relative to the scan root.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use color_eyre::Result;
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;

use crate::hash;
use crate::state::{CLIENT_STATE_FILE, SERVER_STATE_FILE};

/// One file observed on disk during a scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    /// Relative path from the scan root, `/`-separated
    pub path: String,
    /// MD5 hex fingerprint of the content
    pub hash: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Normalize a relative path to forward-slash form
#[must_use]
pub fn normalize_path(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

/// Validate a relative path received from a peer.
///
/// Rejects empty paths, absolute paths, backslashes, and any `.`/`..`
/// segment, so a peer cannot escape the sync root.
#[must_use]
pub fn is_valid_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return false;
    }
    path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// Scanner for a sync root with configurable ignore globs
pub struct Scanner {
    root: PathBuf,
    ignore_globs: Vec<String>,
}

impl Scanner {
    /// Create a scanner for the given root directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore_globs: Vec::new(),
        }
    }

    /// Add an ignore glob (gitignore syntax, matched at any depth)
    #[must_use]
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.ignore_globs.push(pattern.into());
        self
    }

    /// Add several ignore globs
    #[must_use]
    pub fn ignore_all<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_globs.extend(patterns.into_iter().map(Into::into));
        self
    }

    fn walk_builder(&self) -> Result<WalkBuilder> {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(true) // Never sync dot-files
            .ignore(false)
            .parents(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .follow_links(false);

        let mut overrides = OverrideBuilder::new(&self.root);
        // The state documents live inside the tree and must never sync
        overrides.add(&format!("!{SERVER_STATE_FILE}"))?;
        overrides.add(&format!("!{CLIENT_STATE_FILE}"))?;
        for pattern in &self.ignore_globs {
            overrides.add(&format!("!{pattern}"))?;
        }
        builder.overrides(overrides.build()?);

        Ok(builder)
    }

    /// Scan the root and return all file entries, sorted by path
    ///
    /// # Errors
    /// Returns an error if directory traversal or file reading fails
    pub fn scan(&self) -> Result<Vec<ScannedFile>> {
        let mut entries = Vec::new();

        if !self.root.exists() {
            return Ok(entries);
        }

        for result in self.walk_builder()?.build() {
            let entry = result?;
            if entry.depth() == 0 {
                continue;
            }

            // file_type() reports the symlink itself, so links are skipped
            let is_file = entry.file_type().is_some_and(|t| t.is_file());
            if !is_file {
                continue;
            }

            let metadata = entry.metadata()?;
            let relative = entry.path().strip_prefix(&self.root)?;
            let modified: DateTime<Utc> = metadata.modified()?.into();

            entries.push(ScannedFile {
                path: normalize_path(relative),
                hash: hash::file_digest(entry.path())?,
                size: metadata.len(),
                modified,
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_simple_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("file1.txt"), "hello").unwrap();
        fs::write(dir.path().join("file2.txt"), "world").unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "file1.txt");
        assert_eq!(entries[0].hash, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[1].path, "file2.txt");
    }

    #[test]
    fn test_scan_nested_uses_forward_slashes() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        fs::write(dir.path().join("sub/dir/deep.txt"), "deep").unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "sub/dir/deep.txt");
    }

    #[test]
    fn test_scan_skips_ignore_globs() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        fs::write(dir.path().join("skip.tmp"), "skip").unwrap();
        fs::create_dir_all(dir.path().join("logs")).unwrap();
        fs::write(dir.path().join("logs/app.log"), "log").unwrap();

        let entries = Scanner::new(dir.path())
            .ignore("*.tmp")
            .ignore("*.log")
            .scan()
            .unwrap();

        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["keep.txt"]);
    }

    #[test]
    fn test_scan_skips_hidden_and_state_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("visible.txt"), "v").unwrap();
        fs::write(dir.path().join(".hidden"), "h").unwrap();
        fs::write(dir.path().join(CLIENT_STATE_FILE), "{}").unwrap();
        fs::write(dir.path().join(SERVER_STATE_FILE), "{}").unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();

        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["visible.txt"]);
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let entries = Scanner::new(dir.path().join("nope")).scan().unwrap();
        assert!(entries.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_does_not_follow_symlinks() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real.txt"), "real").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();

        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["real.txt"]);
    }

    #[test]
    fn test_path_validation() {
        assert!(is_valid_relative_path("a.txt"));
        assert!(is_valid_relative_path("sub/dir/deep.txt"));
        assert!(!is_valid_relative_path(""));
        assert!(!is_valid_relative_path("/etc/passwd"));
        assert!(!is_valid_relative_path("../escape"));
        assert!(!is_valid_relative_path("sub/../escape"));
        assert!(!is_valid_relative_path("sub//double"));
        assert!(!is_valid_relative_path("win\\style"));
        assert!(!is_valid_relative_path("./dotted"));
    }
}
