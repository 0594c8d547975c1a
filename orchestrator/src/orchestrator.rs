//! Orchestrator facade
//!
//! Owns every component and exposes the operations the HTTP layer and the
//! binary need. Lifecycle:
//!
//! 1. [`Orchestrator::open`] bumps the process epoch and hydrates job records
//!    from the database. Rows that fail to parse are logged and skipped.
//! 2. [`Orchestrator::start`] runs recovery, prunes stale checkpoints
//!    (except those of cancelled jobs), rebuilds the queue and starts the
//!    admission loop.
//! 3. [`Orchestrator::shutdown`] stops admission, stops the active run
//!    (its row stays RUNNING for the next start) and unloads the engine.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointConfig, CheckpointStore};
use crate::db::jobs as job_rows;
use crate::db::Database;
use crate::engine::TranscriptionEngine;
use crate::errors::{OrchestratorError, Result};
use crate::jobs::{
    AdmissionLoop, ErrorKind, JobEvent, JobQueue, JobRunner, JobSnapshot, JobState, JobStateMachine,
    ProgressPublisher, RecoveryConfig, RecoveryController, RecoveryReport, RunnerConfig,
    Transcript, Transition,
};
use crate::model_manager::{EngineStatus, ModelManagerConfig, ModelResourceManager};
use crate::stats::OrchestratorStats;

/// Runtime settings for all components
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub checkpoint: CheckpointConfig,
    pub manager: ModelManagerConfig,
    pub runner: RunnerConfig,
}

pub struct Orchestrator {
    db: Database,
    machine: Arc<JobStateMachine>,
    checkpoints: Arc<CheckpointStore>,
    manager: ModelResourceManager,
    queue: Arc<JobQueue>,
    runner: Arc<JobRunner>,
    stats: Arc<OrchestratorStats>,
    shutdown: CancellationToken,
    admission: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build all components and load persisted jobs. Nothing runs until
    /// [`start`](Self::start).
    pub async fn open(
        db: Database,
        engine: Arc<dyn TranscriptionEngine>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let epoch = {
            let db = db.clone();
            tokio::task::spawn_blocking(move || db.next_epoch()).await??
        };

        let (jobs, corrupt) = {
            let db = db.clone();
            tokio::task::spawn_blocking(move || job_rows::load_all_jobs(&db)).await??
        };
        for e in &corrupt {
            warn!(error = %e, "Skipping unreadable job row");
        }
        info!(epoch = epoch, jobs = jobs.len(), skipped = corrupt.len(), "Job records loaded");

        let checkpoints = Arc::new(CheckpointStore::new(config.checkpoint)?);
        let publisher = Arc::new(ProgressPublisher::new());
        let machine = Arc::new(JobStateMachine::new(
            db.clone(),
            checkpoints.clone(),
            publisher,
            epoch,
        ));
        machine.hydrate(jobs);

        let manager = ModelResourceManager::new(engine, config.manager);
        let stats = Arc::new(OrchestratorStats::new());
        let shutdown = CancellationToken::new();
        let runner = Arc::new(JobRunner::new(
            machine.clone(),
            checkpoints.clone(),
            manager.clone(),
            stats.clone(),
            config.runner,
            shutdown.clone(),
        ));

        Ok(Self {
            db,
            machine,
            checkpoints,
            manager,
            queue: Arc::new(JobQueue::new()),
            runner,
            stats,
            shutdown,
            admission: Mutex::new(None),
        })
    }

    /// Recover in-flight jobs and start admitting. Recovery completes
    /// before the first admission.
    pub async fn start(&self) -> Result<RecoveryReport> {
        if self.lock_admission().is_some() {
            return Err(OrchestratorError::InvalidRequest(
                "orchestrator already started".into(),
            ));
        }

        let checkpoint_config = self.checkpoints.config();
        let recovery = RecoveryController::new(
            self.machine.clone(),
            self.checkpoints.clone(),
            self.stats.clone(),
            RecoveryConfig {
                max_age: checkpoint_config.max_age,
                min_resume_progress: checkpoint_config.min_resume_progress,
            },
        );
        let report = recovery.run().await;

        // Cancelled runs keep their last checkpoint for inspection
        let cancelled: HashSet<Uuid> = self
            .machine
            .jobs_in_states(&[JobState::Failed])
            .await
            .into_iter()
            .filter(|job| job.error.as_ref().map(|e| e.kind) == Some(ErrorKind::Cancelled))
            .map(|job| job.job_id)
            .collect();
        match self.checkpoints.cleanup_stale(&cancelled).await {
            Ok(0) => {}
            Ok(removed) => info!(removed = removed, "Removed stale checkpoints"),
            Err(e) => warn!(error = %e, "Stale checkpoint cleanup failed"),
        }

        for job in self.machine.jobs_in_states(&[JobState::Queued]).await {
            self.queue.push(job.job_id);
        }
        info!(queued = self.queue.len(), "Queue rebuilt");

        let admission = AdmissionLoop::new(
            self.queue.clone(),
            self.machine.clone(),
            self.manager.clone(),
            self.runner.clone(),
            self.shutdown.clone(),
        );
        *self.lock_admission() = Some(tokio::spawn(admission.run()));

        Ok(report)
    }

    /// Create a QUEUED job for `audio_path`
    pub async fn submit(&self, audio_path: &str) -> Result<Arc<JobSnapshot>> {
        let audio_path = audio_path.trim();
        if audio_path.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "audio_path must not be empty".into(),
            ));
        }
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::InvalidRequest(
                "orchestrator is shutting down".into(),
            ));
        }

        let snapshot = self.machine.submit(audio_path.to_string()).await?;
        self.queue.push(snapshot.job_id);
        Ok(snapshot)
    }

    /// Latest snapshot. Never waits on the active job.
    pub fn status(&self, job_id: Uuid) -> Result<Arc<JobSnapshot>> {
        self.machine
            .get(job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    pub fn list(&self) -> Vec<Arc<JobSnapshot>> {
        self.machine.list()
    }

    /// Cancel a job. Already-terminal jobs are returned unchanged.
    /// The job's last checkpoint stays on disk and survives stale cleanup.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Arc<JobSnapshot>> {
        let Transition {
            snapshot,
            previous,
            changed,
        } = self.machine.cancel(job_id).await?;

        if changed {
            match previous {
                JobState::Queued => {
                    self.queue.remove(job_id);
                }
                _ => {
                    self.runner.cancel(job_id);
                }
            }
            self.stats.record_cancelled();
        }
        Ok(snapshot)
    }

    /// Send a job back to the end of the queue from progress 0.0.
    /// QUEUED and LOADING_MODEL jobs are returned unchanged.
    pub async fn restart(&self, job_id: Uuid) -> Result<Arc<JobSnapshot>> {
        let Transition {
            snapshot,
            previous,
            changed,
        } = self.machine.restart(job_id).await?;

        if changed {
            if previous == JobState::Running {
                self.runner.cancel(job_id);
            }
            self.queue.push(job_id);
        }
        Ok(snapshot)
    }

    /// Transcript of a COMPLETED job, `None` for any other state
    pub async fn transcript(&self, job_id: Uuid) -> Result<Option<Transcript>> {
        let snapshot = self.status(job_id)?;
        if snapshot.state != JobState::Completed {
            return Ok(None);
        }

        let db = self.db.clone();
        let transcript =
            tokio::task::spawn_blocking(move || job_rows::load_transcript(&db, job_id)).await??;
        Ok(transcript)
    }

    /// Follow the snapshots of one job
    pub fn subscribe(&self, job_id: Uuid) -> Result<watch::Receiver<Arc<JobSnapshot>>> {
        self.machine
            .publisher()
            .subscribe(job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    /// State-change events of all jobs
    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.machine.publisher().events()
    }

    pub fn engine_status(&self) -> EngineStatus {
        self.manager.status()
    }

    pub fn stats(&self) -> &Arc<OrchestratorStats> {
        &self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_job(&self) -> Option<Uuid> {
        self.runner.active_job()
    }

    pub async fn checkpoint_storage_bytes(&self) -> Result<u64> {
        Ok(self.checkpoints.storage_usage().await?)
    }

    /// Stop admitting, stop the active run and unload the engine. The run's
    /// row keeps its state so the next start recovers it.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.shutdown.cancel();

        let admission = self.lock_admission().take();
        if let Some(task) = admission {
            if let Err(e) = task.await {
                error!(error = %e, "Admission loop failed");
            }
        }

        self.runner.shutdown().await;

        if let Err(e) = self.manager.unload().await {
            warn!(error = %e, "Engine unload failed");
        }

        self.stats.log_summary();
        info!("Orchestrator stopped");
    }

    fn lock_admission(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.admission.lock().unwrap_or_else(|p| p.into_inner())
    }
}
