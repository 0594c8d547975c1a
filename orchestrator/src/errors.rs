use thiserror::Error;
use uuid::Uuid;

use crate::jobs::types::JobState;

/// Errors that can occur in the orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// IO error occurred (file operations, sockets, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence error (job rows, transcripts)
    #[error("Storage error: {0}")]
    Storage(#[from] crate::db::DbError),

    /// Checkpoint store error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    /// The job id is unknown
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// A transition was requested that the lifecycle does not allow
    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    /// A runner reported for an attempt that has been superseded
    #[error("Stale attempt {attempt} for job {job_id} (current attempt {current})")]
    StaleAttempt {
        job_id: Uuid,
        attempt: u32,
        current: u32,
    },

    /// A mutation would have left the job record inconsistent
    #[error("Job {job_id} invariant violated: {reason}")]
    InvariantViolation { job_id: Uuid, reason: String },

    /// Invalid input from a client
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Background task failed to join
    #[error("Task error: {0}")]
    Task(String),
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<toml::ser::Error> for OrchestratorError {
    fn from(e: toml::ser::Error) -> Self {
        OrchestratorError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(e: toml::de::Error) -> Self {
        OrchestratorError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for OrchestratorError {
    fn from(e: tokio::task::JoinError) -> Self {
        OrchestratorError::Task(e.to_string())
    }
}

impl OrchestratorError {
    /// True when a runner's report lost a race with a newer transition
    pub fn is_superseded(&self) -> bool {
        matches!(
            self,
            OrchestratorError::StaleAttempt { .. } | OrchestratorError::IllegalTransition { .. }
        )
    }
}
