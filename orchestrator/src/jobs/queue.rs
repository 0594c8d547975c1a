//! FIFO job queue and admission control
//!
//! The queue holds the ids of QUEUED jobs in admission order. The admission
//! loop admits the oldest one whenever the model manager can hand out its
//! handle, which bounds the active jobs to one. While the engine is not
//! ready nothing is admitted and queued jobs say why in their stage label.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::runner::JobRunner;
use super::state_machine::JobStateMachine;
use crate::model_manager::{AcquireError, ModelResourceManager};

/// FIFO of QUEUED job ids
#[derive(Debug, Default)]
pub struct JobQueue {
    ids: Mutex<VecDeque<Uuid>>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job. A job already queued keeps its position.
    pub fn push(&self, job_id: Uuid) {
        {
            let mut ids = self.lock();
            if ids.contains(&job_id) {
                return;
            }
            ids.push_back(job_id);
            debug!(job_id = %job_id, queue_size = ids.len(), "Job enqueued");
        }
        self.notify.notify_one();
    }

    /// Remove a job wherever it is. Returns whether it was queued.
    pub fn remove(&self, job_id: Uuid) -> bool {
        let mut ids = self.lock();
        match ids.iter().position(|id| *id == job_id) {
            Some(index) => {
                ids.remove(index);
                true
            }
            None => false,
        }
    }

    /// Oldest queued job
    pub fn front(&self) -> Option<Uuid> {
        self.lock().front().copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queued ids in admission order
    pub fn ids(&self) -> Vec<Uuid> {
        self.lock().iter().copied().collect()
    }

    /// Wait until something is pushed
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Uuid>> {
        self.ids.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Background task admitting queued jobs one at a time
pub struct AdmissionLoop {
    queue: Arc<JobQueue>,
    machine: Arc<JobStateMachine>,
    manager: ModelResourceManager,
    runner: Arc<JobRunner>,
    shutdown: CancellationToken,
}

impl AdmissionLoop {
    pub fn new(
        queue: Arc<JobQueue>,
        machine: Arc<JobStateMachine>,
        manager: ModelResourceManager,
        runner: Arc<JobRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            machine,
            manager,
            runner,
            shutdown,
        }
    }

    /// Run until shutdown. Wakes on every push and every engine status change.
    pub async fn run(self) {
        let mut status_rx = self.manager.subscribe_status();
        info!("Admission loop started");

        loop {
            status_rx.borrow_and_update();
            self.admit_ready().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.queue.notified() => {}
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Admission loop stopped");
    }

    /// Admit from the front of the queue while the engine is free
    async fn admit_ready(&self) {
        while let Some(job_id) = self.queue.front() {
            if self.shutdown.is_cancelled() {
                return;
            }

            match self.manager.acquire(job_id) {
                Ok(handle) => {
                    self.queue.remove(job_id);
                    match self.machine.admit(job_id).await {
                        Ok(job) => self.runner.spawn(job, handle),
                        Err(e) => {
                            debug!(job_id = %job_id, reason = %e, "Dropped queue entry");
                        }
                    }
                }
                Err(AcquireError::Busy { .. }) => {
                    self.label_queued(None).await;
                    return;
                }
                Err(AcquireError::NotReady { reason }) => {
                    self.label_queued(Some(&reason)).await;
                    return;
                }
            }
        }
    }

    async fn label_queued(&self, last_failure: Option<&str>) {
        for job_id in self.queue.ids() {
            if let Err(e) = self.machine.set_waiting(job_id, last_failure).await {
                warn!(job_id = %job_id, error = %e, "Failed to update queued label");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = JobQueue::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.push(*id);
        }

        assert_eq!(queue.ids(), ids);
        assert_eq!(queue.front(), Some(ids[0]));
    }

    #[test]
    fn test_push_is_deduplicated() {
        let queue = JobQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        queue.push(a);
        queue.push(b);
        queue.push(a);

        assert_eq!(queue.ids(), vec![a, b]);
    }

    #[test]
    fn test_remove_from_middle() {
        let queue = JobQueue::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.push(*id);
        }

        assert!(queue.remove(ids[1]));
        assert!(!queue.remove(ids[1]));
        assert_eq!(queue.ids(), vec![ids[0], ids[2]]);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = Arc::new(JobQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.notified().await })
        };
        tokio::task::yield_now().await;
        queue.push(Uuid::new_v4());

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!queue.is_empty());
    }
}
