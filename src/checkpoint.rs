//! Durable checkpoint tokens for polling consumers.
//!
//! The polling client holds no durable state. Read models that need to
//! resume after a restart persist the last processed token with a
//! [`CheckpointFile`] and hand it back to
//! [`PollingClient::start_from`](crate::PollingClient::start_from).

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk shape of a checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct StoredCheckpoint {
    checkpoint_token: u64,
}

/// A checkpoint token persisted as JSON at a fixed path.
///
/// Saves are atomic: the token is written to a sibling `.tmp` file and
/// renamed over the target, so a crash mid-save leaves the previous token.
///
/// # Examples
///
/// ```
/// use eventfold_streams::CheckpointFile;
///
/// let dir = tempfile::tempdir().unwrap();
/// let file = CheckpointFile::new(dir.path().join("orders.json"));
/// assert_eq!(file.load().unwrap(), None);
/// file.save(42).unwrap();
/// assert_eq!(file.load().unwrap(), Some(42));
/// ```
#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    /// Point at `path`. Nothing is read or created until the first call.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The checkpoint file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Persist `checkpoint_token`, creating the parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if directory creation, writing or renaming fails.
    pub fn save(&self, checkpoint_token: u64) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.tmp_path();
        let json = serde_json::to_string_pretty(&StoredCheckpoint { checkpoint_token })
            .map_err(io::Error::other)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        tracing::debug!(path = %self.path.display(), checkpoint_token, "checkpoint saved");
        Ok(())
    }

    /// Read the persisted token.
    ///
    /// Returns `Ok(None)` if the file does not exist or is corrupt. A corrupt
    /// checkpoint is not a hard error: the consumer replays from the start.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` for I/O failures other than file-not-found.
    pub fn load(&self) -> io::Result<Option<u64>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<StoredCheckpoint>(&content) {
                Ok(stored) => Ok(Some(stored.checkpoint_token)),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "corrupt checkpoint file, replaying from the start"
                    );
                    Ok(None)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The persisted token, or `0` when there is none.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn load_or_start(&self) -> io::Result<u64> {
        Ok(self.load()?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_none() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let file = CheckpointFile::new(dir.path().join("cp.json"));
        assert_eq!(file.load().expect("load should succeed"), None);
        assert_eq!(file.load_or_start().expect("load should succeed"), 0);
    }

    #[test]
    fn save_then_load_returns_latest_token() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let file = CheckpointFile::new(dir.path().join("cp.json"));
        file.save(7).expect("save should succeed");
        file.save(9).expect("save should succeed");
        assert_eq!(file.load().expect("load should succeed"), Some(9));
        assert!(!file.tmp_path().exists(), "temp file should be renamed away");
    }

    #[test]
    fn corrupt_file_returns_none() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let path = dir.path().join("cp.json");
        std::fs::write(&path, "not json").expect("write should succeed");
        let file = CheckpointFile::new(path);
        assert_eq!(file.load().expect("load should succeed"), None);
    }

    #[test]
    fn save_creates_parent_dir() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let file = CheckpointFile::new(dir.path().join("nested").join("deeper").join("cp.json"));
        file.save(1).expect("save should succeed");
        assert_eq!(file.load().expect("load should succeed"), Some(1));
    }
}
