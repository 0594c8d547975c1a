//! Job and transcript persistence.
//!
//! Every write touches exactly one row; there is no cross-job transaction.

use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::models::{format_timestamp, JobRow, JOB_COLUMNS};
use super::{Database, DbError, Result};
use crate::jobs::types::{Job, JobState, Transcript};

/// Insert a newly submitted job
pub fn insert_job(db: &Database, job: &Job) -> Result<()> {
    let row = JobRow::from_job(job)?;
    let conn = db.get_conn()?;

    conn.execute(
        r#"
        INSERT INTO jobs (
            job_id, audio_path, state, progress, stage_label, created_at, queued_at,
            started_at, completed_at, error_kind, error_message,
            resumable_checkpoint_id, version, attempt
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            row.job_id,
            row.audio_path,
            row.state,
            row.progress,
            row.stage_label,
            row.created_at,
            row.queued_at,
            row.started_at,
            row.completed_at,
            row.error_kind,
            row.error_message,
            row.resumable_checkpoint_id,
            row.version,
            row.attempt,
        ],
    )?;

    debug!(job_id = %job.job_id, "Job row inserted");
    Ok(())
}

/// Overwrite the mutable columns of an existing job row
pub fn update_job(db: &Database, job: &Job) -> Result<()> {
    let row = JobRow::from_job(job)?;
    let conn = db.get_conn()?;

    let rows_affected = conn.execute(
        r#"
        UPDATE jobs
        SET state = ?, progress = ?, stage_label = ?, queued_at = ?, started_at = ?,
            completed_at = ?, error_kind = ?, error_message = ?,
            resumable_checkpoint_id = ?, version = ?, attempt = ?
        WHERE job_id = ?
        "#,
        params![
            row.state,
            row.progress,
            row.stage_label,
            row.queued_at,
            row.started_at,
            row.completed_at,
            row.error_kind,
            row.error_message,
            row.resumable_checkpoint_id,
            row.version,
            row.attempt,
            row.job_id,
        ],
    )?;

    if rows_affected == 0 {
        return Err(DbError::NotFound(format!("Job {} not found", job.job_id)));
    }

    debug!(
        job_id = %job.job_id,
        state = %job.state,
        version = job.version,
        "Job row updated"
    );
    Ok(())
}

/// Load one job
pub fn load_job(db: &Database, job_id: Uuid) -> Result<Option<Job>> {
    let conn = db.get_conn()?;
    let sql = format!("SELECT {} FROM jobs WHERE job_id = ?", JOB_COLUMNS);

    let row = conn
        .query_row(&sql, params![job_id.to_string()], JobRow::from_row)
        .optional()?;

    row.map(JobRow::into_job).transpose()
}

/// Load every persisted job, oldest queue position first.
///
/// Rows that cannot be decoded are skipped and reported separately so one bad
/// row never hides the rest.
pub fn load_all_jobs(db: &Database) -> Result<(Vec<Job>, Vec<DbError>)> {
    let conn = db.get_conn()?;
    let sql = format!("SELECT {} FROM jobs ORDER BY queued_at ASC, created_at ASC", JOB_COLUMNS);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], JobRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut jobs = Vec::with_capacity(rows.len());
    let mut errors = Vec::new();
    for row in rows {
        match row.into_job() {
            Ok(job) => jobs.push(job),
            Err(e) => errors.push(e),
        }
    }

    Ok((jobs, errors))
}

/// Count jobs per state
pub fn count_by_state(db: &Database, state: JobState) -> Result<u64> {
    let conn = db.get_conn()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE state = ?",
        params![state.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Store the final transcript of a job, replacing any earlier one
pub fn save_transcript(db: &Database, job_id: Uuid, transcript: &Transcript) -> Result<()> {
    let segments = serde_json::to_string(&transcript.segments)
        .map_err(|e| DbError::Corrupt(format!("Failed to serialize transcript: {}", e)))?;
    let now = format_timestamp(OffsetDateTime::now_utc())?;

    let conn = db.get_conn()?;
    conn.execute(
        r#"
        INSERT INTO transcripts (job_id, segments, created_at) VALUES (?, ?, ?)
        ON CONFLICT(job_id) DO UPDATE SET segments = excluded.segments,
                                          created_at = excluded.created_at
        "#,
        params![job_id.to_string(), segments, now],
    )?;

    debug!(job_id = %job_id, segments = transcript.segments.len(), "Transcript stored");
    Ok(())
}

/// Load the stored transcript of a job
pub fn load_transcript(db: &Database, job_id: Uuid) -> Result<Option<Transcript>> {
    let conn = db.get_conn()?;
    let segments: Option<String> = conn
        .query_row(
            "SELECT segments FROM transcripts WHERE job_id = ?",
            params![job_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    segments
        .map(|json| {
            serde_json::from_str(&json)
                .map(|segments| Transcript { segments })
                .map_err(|e| DbError::Corrupt(format!("Invalid transcript for {}: {}", job_id, e)))
        })
        .transpose()
}

/// Drop the stored transcript of a job (on restart)
pub fn delete_transcript(db: &Database, job_id: Uuid) -> Result<()> {
    let conn = db.get_conn()?;
    conn.execute(
        "DELETE FROM transcripts WHERE job_id = ?",
        params![job_id.to_string()],
    )?;
    Ok(())
}
