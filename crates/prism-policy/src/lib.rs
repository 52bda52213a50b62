//! Host blocklist oracle.
//!
//! The blocklist is a line-delimited file of host names, one per line.
//! Lookups reopen the file every time so edits take effect on the next
//! request without a reload step.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlocklistError {
    #[error("failed to open blocklist {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to read blocklist {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

/// Policy seam for host blocking decisions.
///
/// Callers treat an `Err` as fail-open: an unreadable blocklist must not
/// deny all traffic.
pub trait HostPolicy: Send + Sync {
    fn is_blocked(&self, host: &str) -> Result<bool, BlocklistError>;
}

/// File-backed blocklist with case-insensitive exact matching.
#[derive(Debug, Clone)]
pub struct FileBlocklist {
    path: PathBuf,
}

impl FileBlocklist {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_text(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

impl HostPolicy for FileBlocklist {
    fn is_blocked(&self, host: &str) -> Result<bool, BlocklistError> {
        let file = File::open(&self.path).map_err(|source| BlocklistError::Open {
            path: self.path_text(),
            source,
        })?;

        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| BlocklistError::Read {
                path: self.path_text(),
                source,
            })?;
            let entry = line.trim();
            if entry.is_empty() {
                continue;
            }
            if entry.eq_ignore_ascii_case(host) {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{BlocklistError, FileBlocklist, HostPolicy};

    fn unique_blocklist_path(prefix: &str) -> PathBuf {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock");
        std::env::temp_dir().join(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            now.as_nanos()
        ))
    }

    #[test]
    fn matches_hosts_case_insensitively() {
        let path = unique_blocklist_path("prism-blocklist-case");
        fs::write(&path, "ads.test\nEXAMPLE.test\n").expect("write blocklist");
        let blocklist = FileBlocklist::new(&path);

        assert!(blocklist.is_blocked("ads.test").expect("lookup"));
        assert!(blocklist.is_blocked("ADS.TEST").expect("lookup"));
        assert!(blocklist.is_blocked("example.test").expect("lookup"));
        assert!(!blocklist.is_blocked("allowed.test").expect("lookup"));

        fs::remove_file(&path).expect("cleanup blocklist");
    }

    #[test]
    fn skips_blank_lines_and_trims_whitespace() {
        let path = unique_blocklist_path("prism-blocklist-blank");
        fs::write(&path, "\n  ads.test  \n\n").expect("write blocklist");
        let blocklist = FileBlocklist::new(&path);

        assert!(blocklist.is_blocked("ads.test").expect("lookup"));
        assert!(!blocklist.is_blocked("").expect("lookup"));

        fs::remove_file(&path).expect("cleanup blocklist");
    }

    #[test]
    fn missing_file_surfaces_an_open_error() {
        let path = unique_blocklist_path("prism-blocklist-missing");
        let blocklist = FileBlocklist::new(&path);
        let error = blocklist.is_blocked("ads.test").expect_err("must fail");
        assert!(matches!(error, BlocklistError::Open { .. }));
    }

    #[test]
    fn rereads_the_file_on_every_lookup() {
        let path = unique_blocklist_path("prism-blocklist-reread");
        fs::write(&path, "ads.test\n").expect("write blocklist");
        let blocklist = FileBlocklist::new(&path);

        assert!(blocklist.is_blocked("ads.test").expect("lookup"));
        fs::write(&path, "other.test\n").expect("rewrite blocklist");
        assert!(!blocklist.is_blocked("ads.test").expect("lookup"));
        assert!(blocklist.is_blocked("other.test").expect("lookup"));

        fs::remove_file(&path).expect("cleanup blocklist");
    }
}
