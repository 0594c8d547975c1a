//! Job State Machine
//!
//! Authoritative owner of every job record. Each job sits behind its own
//! `tokio::sync::Mutex`; a transition holds that lock while it validates the
//! edge, persists the row, swaps the record and publishes the new snapshot,
//! so the published versions of one job are totally ordered. There is no lock
//! spanning jobs.
//!
//! Rows are written on every state change and every checkpoint. Progress and
//! label updates only bump the version and publish. A failed row write is
//! logged and the in-memory transition still commits: recovery reconciles
//! from whatever the table last held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::publisher::ProgressPublisher;
use super::types::{ErrorKind, Job, JobError, JobSnapshot, JobState, Transcript};
use super::version::VersionClock;
use crate::checkpoint::{Checkpoint, CheckpointStore, PartialResult};
use crate::db::jobs as job_rows;
use crate::db::Database;
use crate::errors::{OrchestratorError, Result};

/// Ceiling for progress while not COMPLETED; 1.0 is reserved for completion
pub const MAX_RUNNING_PROGRESS: f32 = 0.999;

/// Stage label prefix shown on queued jobs while the engine cannot load
pub const WAITING_FOR_ENGINE: &str = "waiting for engine";

/// Outcome of an operator request that may be a no-op
#[derive(Debug, Clone)]
pub struct Transition {
    pub snapshot: Arc<JobSnapshot>,
    pub previous: JobState,
    pub changed: bool,
}

struct JobEntry {
    created_at: OffsetDateTime,
    /// Tie-breaker for listing jobs created within the same instant
    seq: u64,
    record: Arc<Mutex<Job>>,
}

pub struct JobStateMachine {
    db: Database,
    checkpoints: Arc<CheckpointStore>,
    publisher: Arc<ProgressPublisher>,
    clock: VersionClock,
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
    next_seq: AtomicU64,
}

impl JobStateMachine {
    pub fn new(
        db: Database,
        checkpoints: Arc<CheckpointStore>,
        publisher: Arc<ProgressPublisher>,
        epoch: u64,
    ) -> Self {
        Self {
            db,
            checkpoints,
            publisher,
            clock: VersionClock::new(epoch),
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn publisher(&self) -> &Arc<ProgressPublisher> {
        &self.publisher
    }

    /// Load persisted records and publish them under this process's epoch.
    ///
    /// A stored row may trail what an earlier process published (label and
    /// progress updates are never written), so every record is re-versioned.
    pub fn hydrate(&self, jobs: Vec<Job>) {
        let mut map = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        for mut job in jobs {
            job.version = self.clock.next(job.version);
            self.publisher.publish(Arc::new(job.snapshot()));
            map.insert(
                job.job_id,
                JobEntry {
                    created_at: job.created_at,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    record: Arc::new(Mutex::new(job)),
                },
            );
        }
        debug!(jobs = map.len(), "Job records hydrated");
    }

    /// Create a QUEUED job. The row must be stored before the job is visible.
    pub async fn submit(&self, audio_path: String) -> Result<Arc<JobSnapshot>> {
        let job = Job::new(audio_path, self.clock.next(0));

        let db = self.db.clone();
        let row = job.clone();
        tokio::task::spawn_blocking(move || job_rows::insert_job(&db, &row)).await??;

        let snapshot = Arc::new(job.snapshot());
        {
            let mut map = self.jobs.write().unwrap_or_else(|p| p.into_inner());
            map.insert(
                job.job_id,
                JobEntry {
                    created_at: job.created_at,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    record: Arc::new(Mutex::new(job)),
                },
            );
        }
        self.publisher.publish(snapshot.clone());

        info!(job_id = %snapshot.job_id, version = snapshot.version, "Job submitted");
        Ok(snapshot)
    }

    /// QUEUED -> LOADING_MODEL, starting a new attempt
    pub async fn admit(&self, job_id: Uuid) -> Result<Job> {
        let record = self.entry(job_id)?;
        let mut job = record.lock().await;
        ensure_edge(&job, JobState::LoadingModel)?;

        let mut next = job.clone();
        next.state = JobState::LoadingModel;
        next.attempt += 1;
        next.started_at = Some(OffsetDateTime::now_utc());
        next.stage_label = "loading model".to_string();

        self.commit(&mut job, next, true).await?;
        info!(job_id = %job_id, attempt = job.attempt, "Job admitted");
        Ok(job.clone())
    }

    /// LOADING_MODEL -> RUNNING. Without a usable checkpoint the run starts
    /// from zero and the checkpoint reference is dropped.
    pub async fn mark_running(
        &self,
        job_id: Uuid,
        attempt: u32,
        resumed: bool,
    ) -> Result<Arc<JobSnapshot>> {
        let record = self.entry(job_id)?;
        let mut job = record.lock().await;
        ensure_attempt(&job, attempt)?;
        ensure_edge(&job, JobState::Running)?;

        let mut next = job.clone();
        next.state = JobState::Running;
        next.stage_label = "transcribing".to_string();
        if !resumed {
            next.progress = 0.0;
            next.resumable_checkpoint_id = None;
        }

        self.commit(&mut job, next, true).await
    }

    /// Apply an engine progress report. Progress never moves backwards and
    /// stays below 1.0 until completion.
    pub async fn report_progress(
        &self,
        job_id: Uuid,
        attempt: u32,
        progress: f32,
        stage_label: Option<String>,
    ) -> Result<Arc<JobSnapshot>> {
        let record = self.entry(job_id)?;
        let mut job = record.lock().await;
        ensure_attempt(&job, attempt)?;
        ensure_state(&job, JobState::Running)?;

        let progress = if progress.is_finite() {
            progress.clamp(0.0, MAX_RUNNING_PROGRESS).max(job.progress)
        } else {
            job.progress
        };
        let label = stage_label.unwrap_or_else(|| job.stage_label.clone());
        if progress == job.progress && label == job.stage_label {
            return Ok(Arc::new(job.snapshot()));
        }

        let mut next = job.clone();
        next.progress = progress;
        next.stage_label = label;
        self.commit(&mut job, next, false).await
    }

    /// Write a checkpoint for the running attempt and point the job at it.
    ///
    /// The write happens under the job lock, so a checkpoint can never land
    /// after a cancel or restart of the same job.
    pub async fn write_checkpoint(
        &self,
        job_id: Uuid,
        attempt: u32,
        progress: f32,
        partial_result: PartialResult,
    ) -> Result<Checkpoint> {
        let record = self.entry(job_id)?;
        let mut job = record.lock().await;
        ensure_attempt(&job, attempt)?;
        ensure_state(&job, JobState::Running)?;

        let checkpoint = self
            .checkpoints
            .save(
                job_id,
                attempt,
                progress.clamp(0.0, MAX_RUNNING_PROGRESS),
                partial_result,
            )
            .await?;

        let mut next = job.clone();
        next.resumable_checkpoint_id = Some(checkpoint.checkpoint_id);
        self.commit(&mut job, next, true).await?;
        Ok(checkpoint)
    }

    /// RUNNING -> COMPLETED, storing the transcript and dropping the checkpoint.
    ///
    /// If the transcript cannot be stored the job fails instead.
    pub async fn complete(
        &self,
        job_id: Uuid,
        attempt: u32,
        transcript: Transcript,
    ) -> Result<Arc<JobSnapshot>> {
        let record = self.entry(job_id)?;
        let mut job = record.lock().await;
        ensure_attempt(&job, attempt)?;
        ensure_edge(&job, JobState::Completed)?;

        let db = self.db.clone();
        let stored = tokio::task::spawn_blocking(move || {
            job_rows::save_transcript(&db, job_id, &transcript)
        })
        .await;
        let store_error = match stored {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(e.to_string()),
        };

        let now = OffsetDateTime::now_utc();
        let mut next = job.clone();
        next.completed_at = Some(now);

        if let Some(reason) = store_error {
            error!(job_id = %job_id, error = %reason, "Failed to store transcript");
            next.state = JobState::Failed;
            next.stage_label = "failed".to_string();
            next.error = Some(JobError::new(
                ErrorKind::EngineRuntimeFailure,
                format!("failed to store transcript: {}", reason),
            ));
            return self.commit(&mut job, next, true).await;
        }

        if let Err(e) = self.checkpoints.delete(job_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to delete checkpoint of completed job");
        }

        next.state = JobState::Completed;
        next.progress = 1.0;
        next.stage_label = "completed".to_string();
        next.resumable_checkpoint_id = None;
        next.error = None;

        let snapshot = self.commit(&mut job, next, true).await?;
        info!(job_id = %job_id, attempt = attempt, "Job completed");
        Ok(snapshot)
    }

    /// Fail the running attempt
    pub async fn fail(
        &self,
        job_id: Uuid,
        attempt: u32,
        error: JobError,
    ) -> Result<Arc<JobSnapshot>> {
        let record = self.entry(job_id)?;
        let mut job = record.lock().await;
        ensure_attempt(&job, attempt)?;
        ensure_edge(&job, JobState::Failed)?;

        warn!(
            job_id = %job_id,
            attempt = attempt,
            kind = %error.kind,
            message = %error.message,
            "Job failed"
        );

        let mut next = job.clone();
        next.state = JobState::Failed;
        next.stage_label = "failed".to_string();
        next.completed_at = Some(OffsetDateTime::now_utc());
        next.error = Some(error);

        self.commit(&mut job, next, true).await
    }

    /// Cancel a job that has not finished. Terminal jobs are left alone.
    ///
    /// The last checkpoint stays on disk; a FAILED job is never resumed
    /// automatically.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Transition> {
        let record = self.entry(job_id)?;
        let mut job = record.lock().await;
        let previous = job.state;

        if previous.is_terminal() {
            return Ok(Transition {
                snapshot: self.current(&job),
                previous,
                changed: false,
            });
        }

        let mut next = job.clone();
        next.state = JobState::Failed;
        next.stage_label = "cancelled".to_string();
        next.completed_at = Some(OffsetDateTime::now_utc());
        next.error = Some(JobError::cancelled());

        let snapshot = self.commit(&mut job, next, true).await?;
        info!(job_id = %job_id, previous = %previous, "Job cancelled");
        Ok(Transition {
            snapshot,
            previous,
            changed: true,
        })
    }

    /// Send a RUNNING, COMPLETED or FAILED job back to the end of the queue
    /// with progress 0.0, discarding its checkpoint and transcript.
    /// QUEUED and LOADING_MODEL jobs are left alone.
    pub async fn restart(&self, job_id: Uuid) -> Result<Transition> {
        let record = self.entry(job_id)?;
        let mut job = record.lock().await;
        let previous = job.state;

        if matches!(previous, JobState::Queued | JobState::LoadingModel) {
            return Ok(Transition {
                snapshot: self.current(&job),
                previous,
                changed: false,
            });
        }

        if let Err(e) = self.checkpoints.delete(job_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to discard checkpoint on restart");
        }
        if previous == JobState::Completed {
            let db = self.db.clone();
            match tokio::task::spawn_blocking(move || job_rows::delete_transcript(&db, job_id))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(job_id = %job_id, error = %e, "Failed to discard transcript"),
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to discard transcript"),
            }
        }

        let mut next = job.clone();
        next.state = JobState::Queued;
        next.progress = 0.0;
        next.stage_label = "queued".to_string();
        next.queued_at = OffsetDateTime::now_utc();
        next.started_at = None;
        next.completed_at = None;
        next.error = None;
        next.resumable_checkpoint_id = None;

        let snapshot = self.commit(&mut job, next, true).await?;
        info!(job_id = %job_id, previous = %previous, "Job restarted");
        Ok(Transition {
            snapshot,
            previous,
            changed: true,
        })
    }

    /// Recovery edge: LOADING_MODEL/RUNNING -> QUEUED.
    ///
    /// With a checkpoint the job keeps its queue position, the checkpoint
    /// reference and the checkpoint's progress; without one it starts over.
    pub async fn requeue_recovered(
        &self,
        job_id: Uuid,
        resume_from: Option<&Checkpoint>,
    ) -> Result<Arc<JobSnapshot>> {
        let record = self.entry(job_id)?;
        let mut job = record.lock().await;
        if !job.state.is_active() {
            return Err(OrchestratorError::IllegalTransition {
                job_id,
                from: job.state,
                to: JobState::Queued,
            });
        }

        let mut next = job.clone();
        next.state = JobState::Queued;
        next.started_at = None;
        next.completed_at = None;
        next.error = None;
        match resume_from {
            Some(checkpoint) => {
                next.progress = checkpoint.progress.clamp(0.0, MAX_RUNNING_PROGRESS);
                next.resumable_checkpoint_id = Some(checkpoint.checkpoint_id);
            }
            None => {
                next.progress = 0.0;
                next.resumable_checkpoint_id = None;
            }
        }
        next.stage_label = queued_label(&next);

        self.commit(&mut job, next, true).await
    }

    /// Show or clear the "waiting for engine" label on a QUEUED job.
    /// Returns the new snapshot if the label changed.
    pub async fn set_waiting(
        &self,
        job_id: Uuid,
        last_failure: Option<&str>,
    ) -> Result<Option<Arc<JobSnapshot>>> {
        let record = self.entry(job_id)?;
        let mut job = record.lock().await;
        if job.state != JobState::Queued {
            return Ok(None);
        }

        let label = match last_failure {
            Some(reason) => format!("{} - last failure: {}", WAITING_FOR_ENGINE, reason),
            None if job.stage_label.starts_with(WAITING_FOR_ENGINE) => queued_label(&job),
            None => return Ok(None),
        };
        if label == job.stage_label {
            return Ok(None);
        }

        let mut next = job.clone();
        next.stage_label = label;
        self.commit(&mut job, next, false).await.map(Some)
    }

    /// Latest published snapshot
    pub fn get(&self, job_id: Uuid) -> Option<Arc<JobSnapshot>> {
        self.publisher.get(job_id)
    }

    /// Copy of the full record
    pub async fn job(&self, job_id: Uuid) -> Option<Job> {
        let record = self.entry(job_id).ok()?;
        let job = record.lock().await;
        Some(job.clone())
    }

    /// Snapshots of all jobs, oldest submission first. Never waits on a job lock.
    pub fn list(&self) -> Vec<Arc<JobSnapshot>> {
        let mut ids: Vec<(OffsetDateTime, u64, Uuid)> = self
            .jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(id, entry)| (entry.created_at, entry.seq, *id))
            .collect();
        ids.sort();

        ids.into_iter()
            .filter_map(|(_, _, id)| self.publisher.get(id))
            .collect()
    }

    /// Records in any of `states`, in queue order
    pub async fn jobs_in_states(&self, states: &[JobState]) -> Vec<Job> {
        let records: Vec<Arc<Mutex<Job>>> = self
            .jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|entry| entry.record.clone())
            .collect();

        let mut jobs = Vec::new();
        for record in records {
            let job = record.lock().await;
            if states.contains(&job.state) {
                jobs.push(job.clone());
            }
        }
        jobs.sort_by_key(|job| (job.queued_at, job.created_at));
        jobs
    }

    fn entry(&self, job_id: Uuid) -> Result<Arc<Mutex<Job>>> {
        self.jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&job_id)
            .map(|entry| entry.record.clone())
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    fn current(&self, job: &Job) -> Arc<JobSnapshot> {
        self.publisher
            .get(job.job_id)
            .unwrap_or_else(|| Arc::new(job.snapshot()))
    }

    /// Version, validate, persist, swap and publish, in that order
    async fn commit(&self, current: &mut Job, mut next: Job, persist: bool) -> Result<Arc<JobSnapshot>> {
        next.version = self.clock.next(current.version);

        if let Err(reason) = next.check_invariants() {
            error!(job_id = %next.job_id, reason = %reason, "Rejected inconsistent transition");
            return Err(OrchestratorError::InvariantViolation {
                job_id: next.job_id,
                reason,
            });
        }

        if persist {
            self.persist(&next).await;
        }

        *current = next;
        let snapshot = Arc::new(current.snapshot());
        self.publisher.publish(snapshot.clone());

        debug!(
            job_id = %snapshot.job_id,
            version = snapshot.version,
            state = %snapshot.state,
            progress = snapshot.progress,
            "Snapshot published"
        );
        Ok(snapshot)
    }

    async fn persist(&self, job: &Job) {
        let db = self.db.clone();
        let row = job.clone();
        let result = tokio::task::spawn_blocking(move || job_rows::update_job(&db, &row)).await;

        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        warn!(
            job_id = %job.job_id,
            version = job.version,
            error = %failure,
            "Failed to persist job row, keeping in-memory state"
        );
    }
}

fn ensure_attempt(job: &Job, attempt: u32) -> Result<()> {
    if job.attempt != attempt {
        return Err(OrchestratorError::StaleAttempt {
            job_id: job.job_id,
            attempt,
            current: job.attempt,
        });
    }
    Ok(())
}

fn ensure_edge(job: &Job, to: JobState) -> Result<()> {
    if !job.state.can_transition_to(to) {
        return Err(OrchestratorError::IllegalTransition {
            job_id: job.job_id,
            from: job.state,
            to,
        });
    }
    Ok(())
}

fn ensure_state(job: &Job, state: JobState) -> Result<()> {
    if job.state != state {
        return Err(OrchestratorError::IllegalTransition {
            job_id: job.job_id,
            from: job.state,
            to: state,
        });
    }
    Ok(())
}

fn queued_label(job: &Job) -> String {
    match job.resumable_checkpoint_id {
        Some(_) => format!("queued (resuming from {:.0}%)", job.progress * 100.0),
        None => "queued".to_string(),
    }
}
