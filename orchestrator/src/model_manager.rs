//! Model Resource Manager - exclusive ownership of the single loaded engine
//!
//! This module hands out the engine to one job at a time with:
//! - A single permit, held by an [`EngineHandle`] and released on drop
//! - Serialized load/unload, with a configurable load timeout
//! - `NotReady` tracking after a failed load, with background retries on an
//!   exponential backoff capped at a ceiling
//! - A `watch` channel of [`EngineStatus`] for the admission loop and the API

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{EngineError, TranscriptionEngine};

/// Load and retry timing
#[derive(Debug, Clone)]
pub struct ModelManagerConfig {
    /// Give up on a single load after this long
    pub load_timeout: Duration,
    /// First retry delay after a failed load
    pub retry_initial: Duration,
    /// Retry delay ceiling
    pub retry_max: Duration,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(300),
            retry_initial: Duration::from_secs(5),
            retry_max: Duration::from_secs(300),
        }
    }
}

/// Load state of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    /// Nothing loaded; the next admitted job loads it
    Unloaded,
    /// A load is in progress
    Loading,
    /// Loaded and usable
    Ready,
    /// The last load failed; a retry is scheduled
    NotReady { reason: String },
}

/// Point-in-time view of the manager, served next to job snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub engine: String,
    #[serde(flatten)]
    pub state: EngineState,
    pub ready: bool,
    pub busy: bool,
    pub active_job: Option<Uuid>,
    pub last_error: Option<String>,
    pub load_attempts: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    pub supports_resume: bool,
}

/// Why the engine could not be handed out
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquireError {
    #[error("Engine is in use by job {active_job:?}")]
    Busy { active_job: Option<Uuid> },

    #[error("Engine not ready: {reason}")]
    NotReady { reason: String },
}

/// Exclusive right to use the engine for one job
pub struct EngineHandle {
    job_id: Uuid,
    shared: Arc<Shared>,
    permit: Option<OwnedSemaphorePermit>,
}

impl EngineHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn engine(&self) -> Arc<dyn TranscriptionEngine> {
        self.shared.engine.clone()
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.shared.update(|inner| {
            if inner.active_job == Some(self.job_id) {
                inner.active_job = None;
            }
        });
        debug!(job_id = %self.job_id, "Engine handle released");
    }
}

struct Inner {
    state: EngineState,
    active_job: Option<Uuid>,
    last_error: Option<String>,
    load_attempts: u32,
    consecutive_failures: u32,
    next_retry_at: Option<OffsetDateTime>,
    retry_pending: bool,
}

struct Shared {
    engine: Arc<dyn TranscriptionEngine>,
    config: ModelManagerConfig,
    permit: Arc<Semaphore>,
    inner: Mutex<Inner>,
    load_lock: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<EngineStatus>,
    shutdown: CancellationToken,
}

/// Owner of the single engine instance
#[derive(Clone)]
pub struct ModelResourceManager {
    shared: Arc<Shared>,
}

impl ModelResourceManager {
    pub fn new(engine: Arc<dyn TranscriptionEngine>, config: ModelManagerConfig) -> Self {
        let inner = Inner {
            state: EngineState::Unloaded,
            active_job: None,
            last_error: None,
            load_attempts: 0,
            consecutive_failures: 0,
            next_retry_at: None,
            retry_pending: false,
        };
        let status = build_status(engine.as_ref(), &inner, false);
        let (status_tx, _) = watch::channel(status);

        Self {
            shared: Arc::new(Shared {
                engine,
                config,
                permit: Arc::new(Semaphore::new(1)),
                inner: Mutex::new(inner),
                load_lock: tokio::sync::Mutex::new(()),
                status_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// False while the last load failed and its retry has not succeeded yet
    pub fn is_ready(&self) -> bool {
        !matches!(self.shared.lock().state, EngineState::NotReady { .. })
    }

    /// True when the engine is loaded
    pub fn is_loaded(&self) -> bool {
        self.shared.lock().state == EngineState::Ready
    }

    /// Try to take the engine for `job_id` without waiting
    pub fn acquire(&self, job_id: Uuid) -> Result<EngineHandle, AcquireError> {
        if let EngineState::NotReady { reason } = &self.shared.lock().state {
            return Err(AcquireError::NotReady {
                reason: reason.clone(),
            });
        }

        let permit = match self.shared.permit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                return Err(AcquireError::Busy {
                    active_job: self.shared.lock().active_job,
                });
            }
        };

        self.shared.update(|inner| inner.active_job = Some(job_id));
        debug!(job_id = %job_id, "Engine handle acquired");

        Ok(EngineHandle {
            job_id,
            shared: self.shared.clone(),
            permit: Some(permit),
        })
    }

    /// Load the engine on behalf of the handle holder, unless already loaded
    pub async fn ensure_loaded(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        debug!(job_id = %handle.job_id(), "Ensuring engine is loaded");
        self.shared.load().await
    }

    /// Unload the engine and stop pending retries
    pub async fn unload(&self) -> Result<(), EngineError> {
        self.shared.shutdown.cancel();
        let _guard = self.shared.load_lock.lock().await;

        if self.is_loaded() {
            self.shared.engine.unload().await?;
        }
        self.shared.update(|inner| {
            inner.state = EngineState::Unloaded;
            inner.next_retry_at = None;
        });
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Receiver that changes whenever the status does
    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.shared.status_tx.subscribe()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a change and publish the resulting status
    fn update(&self, f: impl FnOnce(&mut Inner)) {
        let status = {
            let mut inner = self.lock();
            f(&mut inner);
            build_status(
                self.engine.as_ref(),
                &inner,
                self.permit.available_permits() == 0,
            )
        };
        self.status_tx.send_replace(status);
    }

    async fn load(self: &Arc<Self>) -> Result<(), EngineError> {
        let _guard = self.load_lock.lock().await;
        if self.lock().state == EngineState::Ready {
            return Ok(());
        }

        self.update(|inner| {
            inner.state = EngineState::Loading;
            inner.load_attempts += 1;
        });
        info!(engine = %self.engine.name(), "Loading engine");

        let mut reset = ResetOnDrop {
            shared: self,
            armed: true,
        };
        let result = match tokio::time::timeout(self.config.load_timeout, self.engine.load()).await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Load(format!(
                "load timed out after {}s",
                self.config.load_timeout.as_secs()
            ))),
        };
        reset.armed = false;

        match result {
            Ok(()) => {
                self.update(|inner| {
                    inner.state = EngineState::Ready;
                    inner.consecutive_failures = 0;
                    inner.last_error = None;
                    inner.next_retry_at = None;
                });
                info!(engine = %self.engine.name(), "Engine ready");
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    EngineError::Load(reason) => reason,
                    other => other.to_string(),
                };
                self.record_failure(&reason);
                Err(EngineError::Load(reason))
            }
        }
    }

    fn record_failure(self: &Arc<Self>, reason: &str) {
        let mut schedule = None;
        self.update(|inner| {
            inner.consecutive_failures += 1;
            let delay = backoff(&self.config, inner.consecutive_failures);
            inner.state = EngineState::NotReady {
                reason: reason.to_string(),
            };
            inner.last_error = Some(reason.to_string());
            inner.next_retry_at = Some(OffsetDateTime::now_utc() + delay);
            if !inner.retry_pending {
                inner.retry_pending = true;
                schedule = Some(delay);
            }
        });

        warn!(engine = %self.engine.name(), reason = %reason, "Engine load failed");

        if let Some(delay) = schedule {
            self.schedule_retry(delay);
        }
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Ok(permit) = shared.permit.clone().acquire_owned().await else {
                return;
            };
            shared.update(|inner| inner.retry_pending = false);

            info!(engine = %shared.engine.name(), "Retrying engine load");
            let _ = shared.load().await;

            drop(permit);
            shared.update(|_| {});
        });
    }
}

/// Puts a `Loading` state back to `Unloaded` if the load future is dropped
struct ResetOnDrop<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.update(|inner| {
                if inner.state == EngineState::Loading {
                    inner.state = EngineState::Unloaded;
                }
            });
        }
    }
}

fn backoff(config: &ModelManagerConfig, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    config
        .retry_initial
        .saturating_mul(1u32 << exponent)
        .min(config.retry_max)
}

fn build_status(engine: &dyn TranscriptionEngine, inner: &Inner, busy: bool) -> EngineStatus {
    EngineStatus {
        engine: engine.name().to_string(),
        state: inner.state.clone(),
        ready: inner.state == EngineState::Ready,
        busy,
        active_job: inner.active_job,
        last_error: inner.last_error.clone(),
        load_attempts: inner.load_attempts,
        next_retry_at: inner.next_retry_at,
        supports_resume: engine.supports_resume(),
    }
}
