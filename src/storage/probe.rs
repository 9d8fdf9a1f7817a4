//! Filesystem and Table Probes
//!
//! The rule entity never touches `std::fs` or the history store directly when
//! checking readiness and freshness; it asks a probe. This keeps the checks
//! testable and lets relative rule paths resolve against the run's working
//! directory.

use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Observes files on disk.
pub trait FileProbe: Send + Sync + Debug {
    fn exists(&self, path: &Path) -> bool;
    fn mtime(&self, path: &Path) -> Option<DateTime<Utc>>;
    fn size(&self, path: &Path) -> Option<u64>;
}

/// Observes user tables.
pub trait TableProbe: Send + Sync {
    /// Number of rows, or `None` when the table does not exist.
    fn row_count(&self, table: &str) -> Option<u64>;

    /// Last time any row of the table changed.
    fn last_modified(&self, table: &str) -> Option<DateTime<Utc>>;
}

/// `FileProbe` backed by the local filesystem.
///
/// Relative paths are resolved against `base_dir` when one is set.
#[derive(Debug, Clone, Default)]
pub struct LocalFiles {
    base_dir: Option<PathBuf>,
}

impl LocalFiles {
    pub fn new() -> Self {
        Self { base_dir: None }
    }

    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(dir.into()),
        }
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    /// Resolves a rule path to the path actually probed.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl FileProbe for LocalFiles {
    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    fn mtime(&self, path: &Path) -> Option<DateTime<Utc>> {
        fs::metadata(self.resolve(path))
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from)
    }

    fn size(&self, path: &Path) -> Option<u64> {
        fs::metadata(self.resolve(path)).ok().map(|m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_local_files_missing() {
        let probe = LocalFiles::new();
        let path = Path::new("/nonexistent/ruleflow/file.txt");
        assert!(!probe.exists(path));
        assert!(probe.mtime(path).is_none());
        assert!(probe.size(path).is_none());
    }

    #[test]
    fn test_local_files_relative_to_base() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("data.txt"), "12345").unwrap();

        let probe = LocalFiles::with_base_dir(temp_dir.path());
        assert!(probe.exists(Path::new("data.txt")));
        assert_eq!(probe.size(Path::new("data.txt")), Some(5));
        assert!(probe.mtime(Path::new("data.txt")).is_some());
    }

    #[test]
    fn test_absolute_path_ignores_base() {
        let temp_dir = tempdir().unwrap();
        let file = temp_dir.path().join("abs.txt");
        fs::write(&file, "x").unwrap();

        let probe = LocalFiles::with_base_dir("/somewhere/else");
        assert!(probe.exists(&file));
    }
}
