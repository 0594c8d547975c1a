//! Progress publisher
//!
//! Each job has a `watch` channel holding its latest `Arc<JobSnapshot>`.
//! Readers clone the `Arc` and never see a half-applied transition; writers
//! can only move a channel forward, so a late publish of an older version is
//! dropped instead of overwriting a newer one.
//!
//! State changes are also fanned out on a `broadcast` channel for push
//! consumers (server-sent events).

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::trace;
use uuid::Uuid;

use super::types::{JobSnapshot, JobState};

const EVENT_CAPACITY: usize = 256;

/// A job entered a new state
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    /// State before the change; `None` for a newly submitted job
    pub previous: Option<JobState>,
    pub snapshot: Arc<JobSnapshot>,
}

pub struct ProgressPublisher {
    channels: RwLock<HashMap<Uuid, watch::Sender<Arc<JobSnapshot>>>>,
    events: broadcast::Sender<JobEvent>,
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressPublisher {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            channels: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Publish a snapshot. Returns false if a snapshot with the same or a
    /// higher version is already visible.
    pub fn publish(&self, snapshot: Arc<JobSnapshot>) -> bool {
        let job_id = snapshot.job_id;

        let existing = self.read().get(&job_id).cloned();
        let previous = match existing {
            Some(sender) => {
                let mut previous = None;
                let accepted = sender.send_if_modified(|current| {
                    if snapshot.version > current.version {
                        previous = Some(current.state);
                        *current = snapshot.clone();
                        true
                    } else {
                        false
                    }
                });
                if !accepted {
                    trace!(job_id = %job_id, version = snapshot.version, "Dropped out-of-order snapshot");
                    return false;
                }
                previous
            }
            None => {
                let mut channels = self.write();
                match channels.get(&job_id) {
                    // Lost a race with another first publish; retry through the normal path
                    Some(_) => {
                        drop(channels);
                        return self.publish(snapshot);
                    }
                    None => {
                        let (sender, _) = watch::channel(snapshot.clone());
                        channels.insert(job_id, sender);
                        None
                    }
                }
            }
        };

        if previous != Some(snapshot.state) {
            // No subscribers is fine
            let _ = self.events.send(JobEvent {
                previous,
                snapshot,
            });
        }
        true
    }

    /// Latest snapshot of a job
    pub fn get(&self, job_id: Uuid) -> Option<Arc<JobSnapshot>> {
        self.read()
            .get(&job_id)
            .map(|sender| sender.borrow().clone())
    }

    /// Receiver that yields every snapshot the job publishes from now on
    pub fn subscribe(&self, job_id: Uuid) -> Option<watch::Receiver<Arc<JobSnapshot>>> {
        self.read().get(&job_id).map(|sender| sender.subscribe())
    }

    /// State-change events for all jobs
    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, watch::Sender<Arc<JobSnapshot>>>> {
        self.channels.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, watch::Sender<Arc<JobSnapshot>>>> {
        self.channels.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
