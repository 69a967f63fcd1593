//! Cycle checkpoint file
//!
//! The checkpoint is a single JSON document rewritten after every state
//! change. Writes go to a sibling temp file first and are renamed into
//! place, so a power cut leaves either the old or the new cycle on disk.

use crate::services::ride::CycleCheckpoint;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Reads and writes the checkpoint file
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        info!(file_path = %path.display(), "checkpoint_store_initialized");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last checkpoint, `None` when there is no file yet
    pub fn load(&self) -> anyhow::Result<Option<CycleCheckpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read checkpoint {}", self.path.display()))?;
        let checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Invalid checkpoint {}", self.path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Write a checkpoint, logging instead of failing
    ///
    /// Returns true if the file was replaced.
    pub fn save(&self, checkpoint: &CycleCheckpoint) -> bool {
        match self.write_atomic(checkpoint) {
            Ok(bytes) => {
                debug!(
                    file = %self.path.display(),
                    state = %checkpoint.state.as_str(),
                    entered = %checkpoint.entered,
                    exited = %checkpoint.exited,
                    bytes = %bytes,
                    "checkpoint_written"
                );
                true
            }
            Err(e) => {
                error!(file = %self.path.display(), error = %e, "checkpoint_write_failed");
                false
            }
        }
    }

    fn write_atomic(&self, checkpoint: &CycleCheckpoint) -> std::io::Result<usize> {
        // Create parent directories if they don't exist
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string(checkpoint)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &self.path)?;
        Ok(json.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RideState;
    use tempfile::tempdir;

    fn running_checkpoint() -> CycleCheckpoint {
        CycleCheckpoint {
            state: RideState::Running,
            capacity: 4,
            entered: 3,
            exited: 0,
            boarding_remaining_ms: None,
            ride_remaining_ms: Some(12_000),
            batch_size: 0,
            saved_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cycle.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("state").join("cycle.json"));

        assert!(store.save(&running_checkpoint()));
        assert_eq!(store.load().unwrap(), Some(running_checkpoint()));
        assert!(!dir.path().join("state").join("cycle.tmp").exists());
    }

    #[test]
    fn test_save_replaces_previous() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cycle.json"));

        store.save(&running_checkpoint());
        let mut unloading = running_checkpoint();
        unloading.state = RideState::Unloading;
        unloading.ride_remaining_ms = None;
        unloading.exited = 1;
        store.save(&unloading);

        assert_eq!(store.load().unwrap().unwrap().state, RideState::Unloading);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycle.json");
        fs::write(&path, "{not json").unwrap();

        let store = CheckpointStore::new(&path);
        assert!(store.load().is_err());
    }
}
