//! Job lifecycle types
//!
//! `Job` is the mutable record owned by the state machine. `JobSnapshot` is the
//! immutable view handed to everyone else, always behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting for admission
    Queued,
    /// Admitted, engine handle held, engine loading
    LoadingModel,
    /// Engine is transcribing
    Running,
    /// Transcript produced
    Completed,
    /// Ended with an error (including cancellation)
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::LoadingModel => "LOADING_MODEL",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    /// COMPLETED or FAILED
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// LOADING_MODEL or RUNNING; only valid while a process drives the job
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::LoadingModel | JobState::Running)
    }

    /// Edges reachable through normal operation.
    ///
    /// Recovery additionally moves LOADING_MODEL/RUNNING back to QUEUED; that
    /// edge is only taken by `JobStateMachine::requeue_recovered`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, LoadingModel)
                | (Queued, Failed)
                | (LoadingModel, Running)
                | (LoadingModel, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
                | (Completed, Queued)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobState::Queued),
            "LOADING_MODEL" => Ok(JobState::LoadingModel),
            "RUNNING" => Ok(JobState::Running),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Classification of a job failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    EngineLoadFailure,
    EngineRuntimeFailure,
    Timeout,
    Cancelled,
    ResourceExhausted,
    /// Recovery decision only, never attached to a job
    StaleCheckpoint,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EngineLoadFailure => "EngineLoadFailure",
            ErrorKind::EngineRuntimeFailure => "EngineRuntimeFailure",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::StaleCheckpoint => "StaleCheckpoint",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EngineLoadFailure" => Ok(ErrorKind::EngineLoadFailure),
            "EngineRuntimeFailure" => Ok(ErrorKind::EngineRuntimeFailure),
            "Timeout" => Ok(ErrorKind::Timeout),
            "Cancelled" => Ok(ErrorKind::Cancelled),
            "ResourceExhausted" => Ok(ErrorKind::ResourceExhausted),
            "StaleCheckpoint" => Ok(ErrorKind::StaleCheckpoint),
            _ => Err(format!("Invalid error kind: {}", s)),
        }
    }
}

/// Structured error carried by a FAILED job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Job was cancelled")
    }
}

/// Authoritative record of one transcription request
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: Uuid,
    /// Input audio reference handed to the engine
    pub audio_path: String,
    pub state: JobState,
    pub progress: f32,
    pub stage_label: String,
    pub created_at: OffsetDateTime,
    /// FIFO ordering key; kept when recovery requeues an in-flight job
    pub queued_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub error: Option<JobError>,
    pub resumable_checkpoint_id: Option<Uuid>,
    pub version: u64,
    /// Incremented on every admission
    pub attempt: u32,
}

impl Job {
    /// Create a freshly submitted job
    pub fn new(audio_path: impl Into<String>, version: u64) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            job_id: Uuid::new_v4(),
            audio_path: audio_path.into(),
            state: JobState::Queued,
            progress: 0.0,
            stage_label: "queued".to_string(),
            created_at: now,
            queued_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            resumable_checkpoint_id: None,
            version,
            attempt: 0,
        }
    }

    /// Build the immutable external view of this record
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id,
            version: self.version,
            state: self.state,
            progress: self.progress,
            stage_label: self.stage_label.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
            resumable_checkpoint_id: self.resumable_checkpoint_id,
        }
    }

    /// Check the field-level contract that must hold after every transition
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if !(0.0..=1.0).contains(&self.progress) {
            return Err(format!("progress {} out of range", self.progress));
        }
        if self.state.is_terminal() != self.completed_at.is_some() {
            return Err(format!(
                "completed_at must be set iff terminal (state {})",
                self.state
            ));
        }
        if (self.state == JobState::Failed) != self.error.is_some() {
            return Err(format!("error must be set iff FAILED (state {})", self.state));
        }
        if self.state == JobState::Completed && self.progress < 1.0 {
            return Err("COMPLETED job must report progress 1.0".to_string());
        }
        if self.state != JobState::Completed && self.progress >= 1.0 {
            return Err(format!("progress 1.0 reported while {}", self.state));
        }
        Ok(())
    }
}

/// Immutable, versioned external view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub version: u64,
    pub state: JobState,
    pub progress: f32,
    pub stage_label: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumable_checkpoint_id: Option<Uuid>,
}

/// One diarized transcript segment produced by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start offset in seconds
    pub start: f64,
    /// End offset in seconds
    pub end: f64,
    pub speaker: Option<String>,
    pub text: String,
}

/// Final engine output for a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<Segment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in [
            JobState::Queued,
            JobState::LoadingModel,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("PAUSED".parse::<JobState>().is_err());
    }

    #[test]
    fn test_state_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&JobState::LoadingModel).unwrap();
        assert_eq!(json, "\"LOADING_MODEL\"");
    }

    #[test]
    fn test_transition_table() {
        assert!(JobState::Queued.can_transition_to(JobState::LoadingModel));
        assert!(JobState::Queued.can_transition_to(JobState::Failed));
        assert!(JobState::Running.can_transition_to(JobState::Queued));
        assert!(JobState::Completed.can_transition_to(JobState::Queued));

        assert!(!JobState::Queued.can_transition_to(JobState::Running));
        assert!(!JobState::Completed.can_transition_to(JobState::Failed));
        assert!(!JobState::Failed.can_transition_to(JobState::Completed));
        assert!(!JobState::LoadingModel.can_transition_to(JobState::Completed));
    }

    #[test]
    fn test_new_job_is_queued_and_consistent() {
        let job = Job::new("/tmp/a.wav", 7);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.version, 7);
        assert_eq!(job.attempt, 0);
        assert!(job.check_invariants().is_ok());
    }

    #[test]
    fn test_invariants_reject_completed_without_timestamp() {
        let mut job = Job::new("/tmp/a.wav", 1);
        job.state = JobState::Completed;
        job.progress = 1.0;
        assert!(job.check_invariants().is_err());

        job.completed_at = Some(OffsetDateTime::now_utc());
        assert!(job.check_invariants().is_ok());
    }

    #[test]
    fn test_invariants_reject_failed_without_error() {
        let mut job = Job::new("/tmp/a.wav", 1);
        job.state = JobState::Failed;
        job.completed_at = Some(OffsetDateTime::now_utc());
        assert!(job.check_invariants().is_err());

        job.error = Some(JobError::cancelled());
        assert!(job.check_invariants().is_ok());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut job = Job::new("/tmp/a.wav", 3);
        job.state = JobState::Failed;
        job.completed_at = Some(OffsetDateTime::now_utc());
        job.error = Some(JobError::new(ErrorKind::Timeout, "no progress"));

        let value = serde_json::to_value(job.snapshot()).unwrap();
        assert_eq!(value["state"], "FAILED");
        assert_eq!(value["version"], 3);
        assert_eq!(value["error"]["kind"], "Timeout");
        assert_eq!(value["error"]["message"], "no progress");
        assert!(value["started_at"].is_null());
        assert!(value["completed_at"].is_string());
        assert!(value.get("resumable_checkpoint_id").is_none());
    }
}
