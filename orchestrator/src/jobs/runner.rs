//! Job runner
//!
//! Drives one admitted job from LOADING_MODEL to a terminal state while it
//! holds the engine handle:
//!
//! ```text
//! ensure_loaded ──► mark_running ──► transcribe (spawned task)
//!                                       │ progress reports
//!                                       ▼
//!                          report_progress / write_checkpoint
//!                                       │
//!             complete / fail(kind) ◄───┴──► watchdog: fail(Timeout)
//! ```
//!
//! A cancellation (operator cancel, restart or shutdown) stops the engine and
//! ends the run without a transition of its own; whoever cancelled has
//! already moved the job. On shutdown this leaves the row in RUNNING for the
//! recovery controller.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state_machine::JobStateMachine;
use super::types::{ErrorKind, Job, JobError, JobState, Transcript};
use crate::checkpoint::{CheckpointStore, PartialResult};
use crate::engine::{EngineError, EngineProgress, ProgressSink, ResumeHint, TranscriptionRequest};
use crate::errors::{OrchestratorError, Result};
use crate::model_manager::{EngineHandle, ModelResourceManager};
use crate::stats::OrchestratorStats;

/// Runner timing
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Fail a RUNNING job that reports no progress for this long
    pub watchdog: Duration,
    /// How long a cancelled engine gets to return before its task is aborted
    pub engine_stop_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(30 * 60),
            engine_stop_grace: Duration::from_secs(10),
        }
    }
}

type EngineTask = JoinHandle<std::result::Result<Transcript, EngineError>>;

enum RunEnd {
    Finished(std::result::Result<std::result::Result<Transcript, EngineError>, tokio::task::JoinError>),
    Stopped,
    TimedOut,
}

struct ActiveRun {
    job_id: Uuid,
    attempt: u32,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

pub struct JobRunner {
    machine: Arc<JobStateMachine>,
    checkpoints: Arc<CheckpointStore>,
    manager: ModelResourceManager,
    stats: Arc<OrchestratorStats>,
    config: RunnerConfig,
    shutdown: CancellationToken,
    active: Mutex<Option<ActiveRun>>,
}

impl JobRunner {
    pub fn new(
        machine: Arc<JobStateMachine>,
        checkpoints: Arc<CheckpointStore>,
        manager: ModelResourceManager,
        stats: Arc<OrchestratorStats>,
        config: RunnerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            machine,
            checkpoints,
            manager,
            stats,
            config,
            shutdown,
            active: Mutex::new(None),
        }
    }

    /// Start driving an admitted job. The handle is released when the run ends.
    pub fn spawn(self: &Arc<Self>, job: Job, handle: EngineHandle) {
        let cancel = self.shutdown.child_token();
        let job_id = job.job_id;
        let attempt = job.attempt;

        let mut active = self.lock_active();
        let runner = self.clone();
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            runner.run(job, handle, run_cancel).await;
        });

        *active = Some(ActiveRun {
            job_id,
            attempt,
            cancel,
            task: Some(task),
        });
    }

    /// Stop the run of `job_id`, if it is the active one
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.lock_active().as_ref() {
            Some(run) if run.job_id == job_id => {
                run.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn active_job(&self) -> Option<Uuid> {
        self.lock_active().as_ref().map(|run| run.job_id)
    }

    /// Stop the active run and wait for it to release the engine
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.lock_active().as_mut().and_then(|run| run.task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Runner task failed during shutdown");
            }
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn run(self: Arc<Self>, job: Job, handle: EngineHandle, cancel: CancellationToken) {
        let job_id = job.job_id;
        let attempt = job.attempt;

        match self.drive(&job, &handle, &cancel).await {
            Ok(()) => {}
            Err(e) if e.is_superseded() => {
                debug!(job_id = %job_id, attempt = attempt, reason = %e, "Run superseded");
            }
            Err(e) => {
                error!(job_id = %job_id, attempt = attempt, error = %e, "Run ended with error");
            }
        }

        drop(handle);
        let mut active = self.lock_active();
        if matches!(active.as_ref(), Some(run) if run.job_id == job_id && run.attempt == attempt) {
            *active = None;
        }
    }

    async fn drive(&self, job: &Job, handle: &EngineHandle, cancel: &CancellationToken) -> Result<()> {
        let job_id = job.job_id;
        let attempt = job.attempt;

        let loaded = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(job_id = %job_id, "Run stopped while loading");
                return Ok(());
            }
            result = self.manager.ensure_loaded(handle) => result,
        };
        if let Err(e) = loaded {
            self.machine
                .fail(
                    job_id,
                    attempt,
                    JobError::new(ErrorKind::EngineLoadFailure, e.to_string()),
                )
                .await?;
            self.stats.record_failed();
            return Ok(());
        }

        let resume = self.resume_hint(job).await;
        let start_progress = resume.as_ref().map(|hint| hint.progress).unwrap_or(0.0);
        self.machine
            .mark_running(job_id, attempt, resume.is_some())
            .await?;
        info!(
            job_id = %job_id,
            attempt = attempt,
            resumed = resume.is_some(),
            start_progress = start_progress,
            "Transcription started"
        );

        let started = Instant::now();
        let (sink, mut updates) = ProgressSink::channel();
        let engine = handle.engine();
        let engine_cancel = cancel.child_token();
        let request = TranscriptionRequest {
            job_id,
            audio_path: job.audio_path.clone(),
            resume,
        };
        let mut engine_task: EngineTask = {
            let token = engine_cancel.clone();
            tokio::spawn(async move { engine.transcribe(request, sink, token).await })
        };

        let end = self
            .supervise(job_id, attempt, start_progress, &mut engine_task, &mut updates, cancel)
            .await;

        let joined = match end {
            Ok(RunEnd::Finished(joined)) => joined,
            Ok(RunEnd::Stopped) => {
                self.stop_engine(&engine_cancel, engine_task).await;
                debug!(job_id = %job_id, "Run stopped by cancellation");
                return Ok(());
            }
            Ok(RunEnd::TimedOut) => {
                let message = format!(
                    "no progress for {}s",
                    self.config.watchdog.as_secs()
                );
                let failed = self
                    .machine
                    .fail(job_id, attempt, JobError::new(ErrorKind::Timeout, message))
                    .await;
                self.stop_engine(&engine_cancel, engine_task).await;
                failed?;
                self.stats.record_failed();
                return Ok(());
            }
            Err(e) => {
                self.stop_engine(&engine_cancel, engine_task).await;
                return Err(e);
            }
        };

        match joined {
            Ok(Ok(transcript)) => {
                let snapshot = self.machine.complete(job_id, attempt, transcript).await?;
                if snapshot.state == JobState::Completed {
                    self.stats
                        .record_completed(started.elapsed().as_millis() as u64);
                } else {
                    self.stats.record_failed();
                }
            }
            Ok(Err(EngineError::Cancelled)) => {
                self.machine
                    .fail(job_id, attempt, JobError::cancelled())
                    .await?;
                self.stats.record_cancelled();
            }
            Ok(Err(e)) => {
                self.machine
                    .fail(job_id, attempt, JobError::new(e.kind(), e.to_string()))
                    .await?;
                self.stats.record_failed();
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    "engine panicked during transcription".to_string()
                } else {
                    format!("engine task ended unexpectedly: {}", join_error)
                };
                self.machine
                    .fail(
                        job_id,
                        attempt,
                        JobError::new(ErrorKind::EngineRuntimeFailure, message),
                    )
                    .await?;
                self.stats.record_failed();
            }
        }

        Ok(())
    }

    /// Relay progress and checkpoints until the engine finishes, the run is
    /// cancelled or the watchdog fires
    async fn supervise(
        &self,
        job_id: Uuid,
        attempt: u32,
        start_progress: f32,
        engine_task: &mut EngineTask,
        updates: &mut UnboundedReceiver<EngineProgress>,
        cancel: &CancellationToken,
    ) -> Result<RunEnd> {
        let cadence = self.checkpoints.config().clone();
        let mut checkpointing = true;
        let mut last_checkpoint_at = Instant::now();
        let mut last_checkpoint_progress = start_progress;
        let mut last_progress_at = Instant::now();

        loop {
            let watchdog = tokio::time::sleep_until(last_progress_at + self.config.watchdog);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(RunEnd::Stopped),
                joined = &mut *engine_task => return Ok(RunEnd::Finished(joined)),
                Some(update) = updates.recv() => {
                    last_progress_at = Instant::now();
                    let progress = update.progress;
                    self.machine
                        .report_progress(job_id, attempt, progress, update.stage_label)
                        .await?;

                    if let (true, Some(partial)) = (checkpointing, update.partial) {
                        let due = last_checkpoint_at.elapsed() >= cadence.save_interval
                            || progress - last_checkpoint_progress >= cadence.save_progress_delta;
                        if due {
                            checkpointing = self.checkpoint(job_id, attempt, progress, partial).await?;
                            last_checkpoint_at = Instant::now();
                            last_checkpoint_progress = progress;
                        }
                    }
                }
                _ = watchdog => {
                    warn!(job_id = %job_id, attempt = attempt, "Watchdog fired, no progress reported");
                    return Ok(RunEnd::TimedOut);
                }
            }
        }
    }

    /// Write a checkpoint, retrying once. Returns whether checkpointing
    /// should continue for this run.
    async fn checkpoint(
        &self,
        job_id: Uuid,
        attempt: u32,
        progress: f32,
        partial: PartialResult,
    ) -> Result<bool> {
        for try_no in 1..=2 {
            match self
                .machine
                .write_checkpoint(job_id, attempt, progress, partial.clone())
                .await
            {
                Ok(_) => {
                    self.stats.record_checkpoint();
                    return Ok(true);
                }
                Err(OrchestratorError::Checkpoint(e)) => {
                    warn!(job_id = %job_id, try_no = try_no, error = %e, "Checkpoint write failed");
                }
                Err(e) => return Err(e),
            }
        }

        self.stats.record_checkpoint_failure();
        warn!(job_id = %job_id, "Continuing without checkpoints for this run");
        Ok(false)
    }

    /// Checkpoint to resume from, if the job has a usable one
    async fn resume_hint(&self, job: &Job) -> Option<ResumeHint> {
        let expected = job.resumable_checkpoint_id?;
        let max_age = self.checkpoints.config().max_age;

        match self.checkpoints.load(job.job_id).await {
            Ok(Some(checkpoint))
                if checkpoint.checkpoint_id == expected && !checkpoint.is_stale(max_age) =>
            {
                Some(ResumeHint {
                    checkpoint_id: checkpoint.checkpoint_id,
                    progress: checkpoint.progress,
                    partial_result: checkpoint.partial_result,
                })
            }
            Ok(_) => {
                warn!(job_id = %job.job_id, "Referenced checkpoint is gone or stale, starting from zero");
                None
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Cannot read checkpoint, starting from zero");
                None
            }
        }
    }

    async fn stop_engine(&self, engine_cancel: &CancellationToken, task: EngineTask) {
        engine_cancel.cancel();
        let abort = task.abort_handle();
        if tokio::time::timeout(self.config.engine_stop_grace, task)
            .await
            .is_err()
        {
            warn!("Engine ignored cancellation, aborting its task");
            abort.abort();
        }
    }
}
