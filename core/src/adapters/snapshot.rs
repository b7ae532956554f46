//! Best-effort snapshot of the open port set.
//!
//! Written after every reconciliation so operators (and a restarted watcher's
//! neighbours) can inspect what was open. Never read back by the core.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default location: tmpfs, fast and cleared on reboot.
pub const DEFAULT_SNAPSHOT_PATH: &str = "/dev/shm/portwatch.ports";

/// Writes the current port set as newline-delimited port numbers.
pub struct SnapshotPersister {
    path: PathBuf,
}

impl SnapshotPersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the snapshot with `ports`, logging and swallowing failures.
    pub async fn persist(&self, ports: &[u16]) {
        match self.write(ports).await {
            Ok(()) => debug!(path = %self.path.display(), count = ports.len(), "snapshot written"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "snapshot write failed"),
        }
    }

    /// Overwrite the snapshot atomically (temp file then rename).
    pub async fn write(&self, ports: &[u16]) -> Result<()> {
        let mut content = String::with_capacity(ports.len() * 6);
        for port in ports {
            content.push_str(&port.to_string());
            content.push('\n');
        }

        let temp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to create temp snapshot: {}", e)))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| Error::Persistence(format!("Failed to write snapshot: {}", e)))?;

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to rename snapshot: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_overwrites() {
        let dir = tempdir().unwrap();
        let persister = SnapshotPersister::new(dir.path().join("ports"));

        persister.write(&[22, 8080]).await.unwrap();
        persister.write(&[443]).await.unwrap();

        let content = std::fs::read_to_string(persister.path()).unwrap();
        assert_eq!(content, "443\n");
    }

    #[tokio::test]
    async fn test_empty_set_writes_empty_file() {
        let dir = tempdir().unwrap();
        let persister = SnapshotPersister::new(dir.path().join("ports"));

        persister.write(&[]).await.unwrap();
        assert_eq!(std::fs::read_to_string(persister.path()).unwrap(), "");
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let dir = tempdir().unwrap();
        let persister = SnapshotPersister::new(dir.path().join("missing-dir").join("ports"));

        assert!(matches!(persister.write(&[1]).await, Err(Error::Persistence(_))));
        // Must not panic or propagate
        persister.persist(&[1]).await;
    }
}
