//! Checkpoint store for saving and loading transcription progress
//!
//! This module provides the CheckpointStore which handles:
//! - Atomic overwrite of the single checkpoint kept per job
//! - Loading checkpoints for recovery, with integrity verification
//! - Deleting checkpoints once a job completes or restarts
//! - Cleanup of checkpoints past their retention age

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{Checkpoint, CheckpointConfig, CheckpointError, PartialResult, Result};

/// Manages checkpoint storage and retrieval
pub struct CheckpointStore {
    /// Configuration
    config: CheckpointConfig,
}

impl CheckpointStore {
    /// Create a new checkpoint store
    pub fn new(config: CheckpointConfig) -> Result<Self> {
        // Ensure checkpoint directory exists
        std::fs::create_dir_all(&config.checkpoint_dir)?;

        Ok(Self { config })
    }

    /// Get checkpoint directory
    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Save progress for a job, replacing its previous checkpoint
    pub async fn save(
        &self,
        job_id: Uuid,
        attempt: u32,
        progress: f32,
        partial_result: PartialResult,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(job_id, attempt, progress, partial_result);
        self.write(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Write a checkpoint record.
    ///
    /// The bytes go to a temporary sibling first, are flushed, and only then
    /// renamed over the live file, so readers see either the old or the new
    /// checkpoint and never a partial one.
    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let data = checkpoint
            .to_cbor()
            .map_err(|e| CheckpointError::Encode(e.to_string()))?;

        let file_path = Checkpoint::file_path(&self.config.checkpoint_dir, checkpoint.job_id);
        let temp_path = file_path.with_extension("ckpt.tmp");

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(target_os = "windows")]
        {
            // Windows doesn't support atomic rename over existing file
            if tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
                tokio::fs::remove_file(&file_path).await?;
            }
        }

        tokio::fs::rename(&temp_path, &file_path).await?;

        debug!(
            job_id = %checkpoint.job_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            progress = checkpoint.progress,
            size_bytes = data.len(),
            "Checkpoint saved"
        );

        Ok(())
    }

    /// Load the checkpoint for a job, if any
    pub async fn load(&self, job_id: Uuid) -> Result<Option<Checkpoint>> {
        let path = Checkpoint::file_path(&self.config.checkpoint_dir, job_id);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(job_id = %job_id, "No checkpoint found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint = Checkpoint::from_cbor(&data).map_err(|e| CheckpointError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if checkpoint.job_id != job_id {
            return Err(CheckpointError::Corrupt {
                path,
                reason: format!("belongs to job {}", checkpoint.job_id),
            });
        }
        if !checkpoint.verify() {
            return Err(CheckpointError::Corrupt {
                path,
                reason: "hash mismatch".to_string(),
            });
        }

        debug!(
            job_id = %job_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            progress = checkpoint.progress,
            "Checkpoint loaded"
        );

        Ok(Some(checkpoint))
    }

    /// Delete the checkpoint for a job. Returns whether one existed.
    pub async fn delete(&self, job_id: Uuid) -> Result<bool> {
        let path = Checkpoint::file_path(&self.config.checkpoint_dir, job_id);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(job_id = %job_id, "Checkpoint deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove checkpoints (and leftover temp files) older than the retention age.
    /// Checkpoints of jobs in `retain` are kept regardless of age.
    pub async fn cleanup_stale(&self, retain: &HashSet<Uuid>) -> Result<u32> {
        let mut deleted = 0;
        let mut entries = tokio::fs::read_dir(&self.config.checkpoint_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if checkpoint_job_id(&path).is_some_and(|id| retain.contains(&id)) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };

            let age = std::time::SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();

            if metadata.is_file() && age > self.config.max_age {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale checkpoint"),
                }
            }
        }

        if deleted > 0 {
            info!(deleted = deleted, "Cleaned up stale checkpoints");
        }

        Ok(deleted)
    }

    /// Get total checkpoint storage usage
    pub async fn storage_usage(&self) -> Result<u64> {
        let mut size = 0;
        let mut entries = tokio::fs::read_dir(&self.config.checkpoint_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(metadata) = entry.metadata().await {
                if metadata.is_file() {
                    size += metadata.len();
                }
            }
        }
        Ok(size)
    }

    /// Path of the live checkpoint file for a job
    pub fn path_for(&self, job_id: Uuid) -> PathBuf {
        Checkpoint::file_path(&self.config.checkpoint_dir, job_id)
    }
}

/// Job id of a live `<uuid>.ckpt` file; temp files have none
fn checkpoint_job_id(path: &Path) -> Option<Uuid> {
    if path.extension()? != "ckpt" {
        return None;
    }
    Uuid::parse_str(path.file_stem()?.to_str()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::Segment;
    use tempfile::TempDir;

    fn test_store(temp_dir: &TempDir) -> CheckpointStore {
        let config = CheckpointConfig {
            checkpoint_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        CheckpointStore::new(config).unwrap()
    }

    fn partial(text: &str) -> PartialResult {
        PartialResult {
            segments: vec![Segment {
                start: 0.0,
                end: 1.0,
                speaker: None,
                text: text.to_string(),
            }],
            processed_until_secs: 1.0,
            engine_state: None,
        }
    }

    #[tokio::test]
    async fn test_checkpoint_store_creation() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");
        let store = CheckpointStore::new(CheckpointConfig {
            checkpoint_dir: nested.clone(),
            ..Default::default()
        })
        .unwrap();
        assert!(store.checkpoint_dir().exists());
    }

    #[tokio::test]
    async fn test_save_and_load_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let job_id = Uuid::new_v4();

        let saved = store.save(job_id, 1, 0.45, partial("hello")).await.unwrap();
        let loaded = store.load(job_id).await.unwrap().unwrap();

        assert_eq!(loaded, saved);
        assert_eq!(loaded.progress, 0.45);
        assert_eq!(loaded.partial_result.segments[0].text, "hello");
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let job_id = Uuid::new_v4();

        let first = store.save(job_id, 1, 0.2, partial("one")).await.unwrap();
        let second = store.save(job_id, 1, 0.4, partial("two")).await.unwrap();
        assert_ne!(first.checkpoint_id, second.checkpoint_id);

        let loaded = store.load(job_id).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_id, second.checkpoint_id);

        // One live file, no temp leftovers
        let files: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_no_checkpoint_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);

        let result = store.load(Uuid::new_v4()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_garbage_file_is_reported_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let job_id = Uuid::new_v4();

        std::fs::write(store.path_for(job_id), b"not cbor at all").unwrap();

        let err = store.load(job_id).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_checkpoint_for_other_job_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();

        store.save(job_a, 1, 0.5, partial("a")).await.unwrap();
        std::fs::copy(store.path_for(job_a), store.path_for(job_b)).unwrap();

        let err = store.load(job_b).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_delete_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let job_id = Uuid::new_v4();

        store.save(job_id, 1, 0.3, partial("x")).await.unwrap();
        assert!(store.delete(job_id).await.unwrap());
        assert!(!store.delete(job_id).await.unwrap());
        assert!(store.load(job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_fresh_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        let job_id = Uuid::new_v4();

        store.save(job_id, 1, 0.3, partial("x")).await.unwrap();
        assert_eq!(store.cleanup_stale(&HashSet::new()).await.unwrap(), 0);
        assert!(store.load(job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_skips_retained_jobs() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(CheckpointConfig {
            checkpoint_dir: temp_dir.path().to_path_buf(),
            max_age: std::time::Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap();
        let kept = Uuid::new_v4();
        let expired = Uuid::new_v4();

        store.save(kept, 1, 0.3, partial("kept")).await.unwrap();
        store.save(expired, 1, 0.3, partial("expired")).await.unwrap();
        std::fs::write(store.path_for(expired).with_extension("ckpt.tmp"), b"torn").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let retain = HashSet::from([kept]);
        assert_eq!(store.cleanup_stale(&retain).await.unwrap(), 2);
        assert!(store.path_for(kept).exists());
        assert!(!store.path_for(expired).exists());
    }

    #[tokio::test]
    async fn test_storage_usage() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);

        assert_eq!(store.storage_usage().await.unwrap(), 0);

        store.save(Uuid::new_v4(), 1, 0.3, partial("x")).await.unwrap();
        assert!(store.storage_usage().await.unwrap() > 0);
    }
}
