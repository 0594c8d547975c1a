//! Recovery controller
//!
//! Runs once at startup, before admission. Every job the previous process
//! left in LOADING_MODEL or RUNNING goes back to QUEUED, either resuming from
//! its checkpoint or starting over:
//!
//! | Checkpoint                         | Decision                         |
//! |------------------------------------|----------------------------------|
//! | missing                            | restart from 0.0                 |
//! | unreadable / hash mismatch         | restart from 0.0, file removed   |
//! | older than `max_age`               | restart from 0.0, file removed   |
//! | progress below `min_resume_progress` | restart from 0.0, file removed |
//! | otherwise                          | resume, keeps progress + ref     |
//!
//! A failure on one job is logged and never stops the others.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::state_machine::JobStateMachine;
use super::types::{ErrorKind, JobState};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::stats::OrchestratorStats;

/// Why a job is restarted from zero
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RestartReason {
    NoCheckpoint,
    Corrupt(String),
    Stale,
    BelowThreshold(f32),
}

/// What recovery did with one job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RecoveryDecision {
    Resume { checkpoint_id: Uuid, progress: f32 },
    Restart { cause: RestartReason },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredJob {
    pub job_id: Uuid,
    pub previous_state: JobState,
    pub decision: RecoveryDecision,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub jobs: Vec<RecoveredJob>,
    /// Jobs whose requeue failed; they stay as they were
    pub errors: Vec<String>,
}

impl RecoveryReport {
    pub fn resumed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| matches!(job.decision, RecoveryDecision::Resume { .. }))
            .count()
    }

    pub fn restarted(&self) -> usize {
        self.jobs.len() - self.resumed()
    }

    pub fn decision_for(&self, job_id: Uuid) -> Option<&RecoveryDecision> {
        self.jobs
            .iter()
            .find(|job| job.job_id == job_id)
            .map(|job| &job.decision)
    }
}

/// Resume thresholds
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_age: Duration,
    pub min_resume_progress: f32,
}

pub struct RecoveryController {
    machine: Arc<JobStateMachine>,
    checkpoints: Arc<CheckpointStore>,
    stats: Arc<OrchestratorStats>,
    config: RecoveryConfig,
}

impl RecoveryController {
    pub fn new(
        machine: Arc<JobStateMachine>,
        checkpoints: Arc<CheckpointStore>,
        stats: Arc<OrchestratorStats>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            machine,
            checkpoints,
            stats,
            config,
        }
    }

    /// Requeue every in-flight job
    pub async fn run(&self) -> RecoveryReport {
        let in_flight = self
            .machine
            .jobs_in_states(&[JobState::LoadingModel, JobState::Running])
            .await;
        let mut report = RecoveryReport::default();

        if in_flight.is_empty() {
            info!("No in-flight jobs to recover");
            return report;
        }
        info!(jobs = in_flight.len(), "Recovering in-flight jobs");

        for job in in_flight {
            let (decision, checkpoint) = self.decide(job.job_id).await;

            if let RecoveryDecision::Restart { cause } = &decision {
                if !matches!(cause, RestartReason::NoCheckpoint) {
                    if let Err(e) = self.checkpoints.delete(job.job_id).await {
                        warn!(job_id = %job.job_id, error = %e, "Failed to remove unusable checkpoint");
                    }
                }
            }

            match self
                .machine
                .requeue_recovered(job.job_id, checkpoint.as_ref())
                .await
            {
                Ok(snapshot) => {
                    info!(
                        job_id = %job.job_id,
                        previous = %job.state,
                        progress = snapshot.progress,
                        decision = ?decision,
                        "Job recovered"
                    );
                    self.stats
                        .record_recovery(matches!(decision, RecoveryDecision::Resume { .. }));
                    report.jobs.push(RecoveredJob {
                        job_id: job.job_id,
                        previous_state: job.state,
                        decision,
                    });
                }
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "Failed to requeue job");
                    report.errors.push(format!("{}: {}", job.job_id, e));
                }
            }
        }

        info!(
            resumed = report.resumed(),
            restarted = report.restarted(),
            failed = report.errors.len(),
            "Recovery finished"
        );
        report
    }

    /// Decide resume vs restart from the checkpoint on disk
    async fn decide(&self, job_id: Uuid) -> (RecoveryDecision, Option<Checkpoint>) {
        let restart = |cause| (RecoveryDecision::Restart { cause }, None);

        let checkpoint = match self.checkpoints.load(job_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return restart(RestartReason::NoCheckpoint),
            Err(e) => return restart(RestartReason::Corrupt(e.to_string())),
        };

        if checkpoint.is_stale(self.config.max_age) {
            warn!(
                job_id = %job_id,
                kind = %ErrorKind::StaleCheckpoint,
                age_secs = checkpoint.age().as_secs(),
                "Checkpoint too old to resume"
            );
            return restart(RestartReason::Stale);
        }
        if checkpoint.progress < self.config.min_resume_progress {
            return restart(RestartReason::BelowThreshold(checkpoint.progress));
        }

        (
            RecoveryDecision::Resume {
                checkpoint_id: checkpoint.checkpoint_id,
                progress: checkpoint.progress,
            },
            Some(checkpoint),
        )
    }
}
