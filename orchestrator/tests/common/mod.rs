#![allow(dead_code)]

use orchestrator::checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore};
use orchestrator::engine::{SimulatedEngine, SimulatedEngineConfig, TranscriptionEngine};
use orchestrator::jobs::{JobSnapshot, RunnerConfig};
use orchestrator::model_manager::ModelManagerConfig;
use orchestrator::{Database, Orchestrator, OrchestratorConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(10);

/// Storage directory shared by successive orchestrator instances
pub struct Harness {
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            checkpoint_dir: self.dir.path().join("checkpoints"),
            // Checkpoint on every report carrying a partial result
            save_progress_delta: 0.0,
            ..Default::default()
        }
    }

    pub fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            checkpoint: self.checkpoint_config(),
            manager: ModelManagerConfig {
                load_timeout: Duration::from_secs(5),
                retry_initial: Duration::from_millis(200),
                retry_max: Duration::from_secs(1),
            },
            runner: RunnerConfig {
                watchdog: Duration::from_secs(5),
                engine_stop_grace: Duration::from_secs(1),
            },
        }
    }

    pub fn database(&self) -> Database {
        let path = self.dir.path().join("orchestrator.db");
        let db = Database::new(path.to_str().expect("utf-8 temp path"))
            .expect("Failed to open database");
        db.migrate().expect("Failed to run migrations");
        db
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(self.checkpoint_config()).expect("Failed to open checkpoint store")
    }

    pub async fn open(&self, engine: Arc<dyn TranscriptionEngine>) -> Orchestrator {
        self.open_with(engine, self.config()).await
    }

    pub async fn open_with(
        &self,
        engine: Arc<dyn TranscriptionEngine>,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        Orchestrator::open(self.database(), engine, config)
            .await
            .expect("Failed to open orchestrator")
    }
}

/// Engine with `steps` progress reports, 5 ms apart
pub fn stepped_engine(steps: u32) -> Arc<SimulatedEngine> {
    Arc::new(SimulatedEngine::new(SimulatedEngineConfig {
        steps,
        step_delay_ms: 5,
        load_delay_ms: 0,
        supports_resume: true,
    }))
}

/// Wait until the job's latest snapshot satisfies `done`
pub async fn wait_for_job(
    orchestrator: &Orchestrator,
    job_id: Uuid,
    done: impl Fn(&JobSnapshot) -> bool,
) -> Arc<JobSnapshot> {
    let mut rx = orchestrator.subscribe(job_id).expect("job should exist");
    let snapshot = tokio::time::timeout(WAIT, rx.wait_for(|s| done(s)))
        .await
        .expect("timed out waiting for job")
        .expect("publisher dropped")
        .clone();
    snapshot
}

/// Wait until a checkpoint with at least `min_progress` is on disk
pub async fn wait_for_checkpoint(
    store: &CheckpointStore,
    job_id: Uuid,
    min_progress: f32,
) -> Checkpoint {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(Some(checkpoint)) = store.load(job_id).await {
                if checkpoint.progress >= min_progress - 1e-6 {
                    return checkpoint;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for checkpoint")
}
