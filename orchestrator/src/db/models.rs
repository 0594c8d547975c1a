//! Row mapping between SQLite and the job model.
//!
//! Timestamps are stored as RFC 3339 text, states and error kinds as their
//! canonical string names.

use rusqlite::Row;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{DbError, Result};
use crate::jobs::types::{ErrorKind, Job, JobError, JobState};

/// Column list shared by every job SELECT, in `job_from_row` order
pub const JOB_COLUMNS: &str = "job_id, audio_path, state, progress, stage_label, created_at, \
     queued_at, started_at, completed_at, error_kind, error_message, \
     resumable_checkpoint_id, version, attempt";

/// Raw job row, all columns as stored
#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_id: String,
    pub audio_path: String,
    pub state: String,
    pub progress: f64,
    pub stage_label: String,
    pub created_at: String,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub resumable_checkpoint_id: Option<String>,
    pub version: i64,
    pub attempt: i64,
}

impl JobRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            audio_path: row.get(1)?,
            state: row.get(2)?,
            progress: row.get(3)?,
            stage_label: row.get(4)?,
            created_at: row.get(5)?,
            queued_at: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            error_kind: row.get(9)?,
            error_message: row.get(10)?,
            resumable_checkpoint_id: row.get(11)?,
            version: row.get(12)?,
            attempt: row.get(13)?,
        })
    }

    pub fn from_job(job: &Job) -> Result<Self> {
        Ok(Self {
            job_id: job.job_id.to_string(),
            audio_path: job.audio_path.clone(),
            state: job.state.as_str().to_string(),
            progress: job.progress as f64,
            stage_label: job.stage_label.clone(),
            created_at: format_timestamp(job.created_at)?,
            queued_at: format_timestamp(job.queued_at)?,
            started_at: job.started_at.map(format_timestamp).transpose()?,
            completed_at: job.completed_at.map(format_timestamp).transpose()?,
            error_kind: job.error.as_ref().map(|e| e.kind.as_str().to_string()),
            error_message: job.error.as_ref().map(|e| e.message.clone()),
            resumable_checkpoint_id: job.resumable_checkpoint_id.map(|id| id.to_string()),
            version: job.version as i64,
            attempt: job.attempt as i64,
        })
    }

    pub fn into_job(self) -> Result<Job> {
        let job_id = parse_uuid(&self.job_id)?;
        let state: JobState = self.state.parse().map_err(DbError::Corrupt)?;

        let error = match (self.error_kind, self.error_message) {
            (Some(kind), message) => Some(JobError {
                kind: kind.parse::<ErrorKind>().map_err(DbError::Corrupt)?,
                message: message.unwrap_or_default(),
            }),
            (None, _) => None,
        };

        Ok(Job {
            job_id,
            audio_path: self.audio_path,
            state,
            progress: self.progress.clamp(0.0, 1.0) as f32,
            stage_label: self.stage_label,
            created_at: parse_timestamp(&self.created_at)?,
            queued_at: parse_timestamp(&self.queued_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
            error,
            resumable_checkpoint_id: self
                .resumable_checkpoint_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            version: self.version.max(0) as u64,
            attempt: self.attempt.max(0) as u32,
        })
    }
}

pub fn format_timestamp(ts: OffsetDateTime) -> Result<String> {
    ts.format(&Rfc3339)
        .map_err(|e| DbError::Corrupt(format!("Failed to format timestamp: {}", e)))
}

pub fn parse_timestamp(s: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| DbError::Corrupt(format!("Invalid timestamp '{}': {}", s, e)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| DbError::Corrupt(format!("Invalid uuid '{}': {}", s, e)))
}
