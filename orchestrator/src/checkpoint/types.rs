//! Checkpoint types and structures
//!
//! This module defines the types used for checkpointing transcription state.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::types::Segment;

/// Checkpoint store errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode checkpoint: {0}")]
    Encode(String),

    #[error("Corrupt checkpoint at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Configuration for checkpoint management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory for storing checkpoints
    pub checkpoint_dir: PathBuf,

    /// Checkpoints older than this are never resumed from
    #[serde(with = "duration_secs")]
    pub max_age: Duration,

    /// Checkpoints below this progress are not worth resuming
    pub min_resume_progress: f32,

    /// Save at least this often while RUNNING
    #[serde(with = "duration_secs")]
    pub save_interval: Duration,

    /// Save whenever progress advanced by this much since the last save
    pub save_progress_delta: f32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".transcribe")
                .join("checkpoints"),
            max_age: Duration::from_secs(24 * 60 * 60), // 24 hours
            min_resume_progress: 0.10,
            save_interval: Duration::from_secs(30),
            save_progress_delta: 0.05,
        }
    }
}

/// Whatever partial output the engine could emit before the checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    /// Segments finalized so far
    pub segments: Vec<Segment>,

    /// Audio position (seconds) the engine had fully processed
    pub processed_until_secs: f64,

    /// Opaque engine cursor, if the engine supports mid-stream resume
    pub engine_state: Option<Vec<u8>>,
}

/// A checkpoint containing transcription state for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint identifier, new on every save
    pub checkpoint_id: Uuid,

    /// Job this checkpoint belongs to
    pub job_id: Uuid,

    /// Admission attempt that wrote it
    pub attempt: u32,

    /// Job progress at checkpoint time
    pub progress: f32,

    /// Partial engine output
    pub partial_result: PartialResult,

    /// Timestamp when the checkpoint was written (Unix seconds)
    pub written_at: u64,

    /// SHA-256 of the encoded partial result
    pub data_hash: String,
}

impl Checkpoint {
    /// Create a checkpoint stamped with the current time
    pub fn new(job_id: Uuid, attempt: u32, progress: f32, partial_result: PartialResult) -> Self {
        let mut checkpoint = Self {
            checkpoint_id: Uuid::new_v4(),
            job_id,
            attempt,
            progress: progress.clamp(0.0, 1.0),
            partial_result,
            written_at: unix_now(),
            data_hash: String::new(),
        };
        checkpoint.data_hash = checkpoint.compute_hash();
        checkpoint
    }

    /// Get age of checkpoint
    pub fn age(&self) -> Duration {
        Duration::from_secs(unix_now().saturating_sub(self.written_at))
    }

    /// True when the checkpoint is older than `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    /// SHA-256 over the identifying fields and the partial result
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.job_id.as_bytes());
        hasher.update(self.attempt.to_le_bytes());
        hasher.update(self.progress.to_le_bytes());
        if let Ok(json) = serde_json::to_vec(&self.partial_result) {
            hasher.update(&json);
        }
        format!("{:x}", hasher.finalize())
    }

    /// True when the stored hash matches the content
    pub fn verify(&self) -> bool {
        self.data_hash == self.compute_hash()
    }

    /// Serialize checkpoint to CBOR bytes
    pub fn to_cbor(&self) -> std::result::Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    /// Deserialize checkpoint from CBOR bytes
    pub fn from_cbor(bytes: &[u8]) -> std::result::Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }

    /// Get file path for a job's checkpoint
    pub fn file_path(base_dir: &Path, job_id: Uuid) -> PathBuf {
        base_dir.join(format!("{}.ckpt", job_id))
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serde helper storing a `Duration` as whole seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
