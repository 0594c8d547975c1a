//! Orchestrator statistics tracking
//!
//! Process-lifetime counters for job outcomes, checkpoints and recoveries.
//! They reset on restart; the job table is the durable record.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters updated by the runner and recovery controller
#[derive(Debug)]
pub struct OrchestratorStats {
    /// Jobs that reached COMPLETED
    pub jobs_completed: AtomicU64,

    /// Jobs that reached FAILED for any reason other than cancellation
    pub jobs_failed: AtomicU64,

    /// Jobs cancelled by an operator
    pub jobs_cancelled: AtomicU64,

    /// Total time spent in RUNNING by completed jobs, in milliseconds
    pub total_run_time_ms: AtomicU64,

    /// Checkpoints written
    pub checkpoints_written: AtomicU64,

    /// Checkpoint writes that failed after their retry
    pub checkpoint_failures: AtomicU64,

    /// Jobs requeued with their checkpoint by recovery
    pub recoveries_resumed: AtomicU64,

    /// Jobs requeued from zero by recovery
    pub recoveries_restarted: AtomicU64,

    /// Start time for uptime tracking
    pub start_time: Instant,
}

impl Default for OrchestratorStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable copy of the counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub checkpoints_written: u64,
    pub checkpoint_failures: u64,
    pub recoveries_resumed: u64,
    pub recoveries_restarted: u64,
    pub success_rate: f64,
    pub avg_run_time_ms: f64,
    pub uptime: String,
}

impl OrchestratorStats {
    pub fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            total_run_time_ms: AtomicU64::new(0),
            checkpoints_written: AtomicU64::new(0),
            checkpoint_failures: AtomicU64::new(0),
            recoveries_resumed: AtomicU64::new(0),
            recoveries_restarted: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a completed job
    pub fn record_completed(&self, run_time_ms: u64) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.total_run_time_ms
            .fetch_add(run_time_ms, Ordering::Relaxed);
    }

    /// Record a failed job
    pub fn record_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_failure(&self) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one recovery decision
    pub fn record_recovery(&self, resumed: bool) {
        if resumed {
            self.recoveries_resumed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.recoveries_restarted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Completed + failed (cancellations excluded)
    pub fn total_jobs(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed) + self.jobs_failed.load(Ordering::Relaxed)
    }

    /// Get success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.total_jobs();
        if total == 0 {
            return 0.0;
        }
        self.jobs_completed.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn avg_run_time_ms(&self) -> f64 {
        let jobs = self.jobs_completed.load(Ordering::Relaxed);
        if jobs == 0 {
            return 0.0;
        }
        self.total_run_time_ms.load(Ordering::Relaxed) as f64 / jobs as f64
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Format uptime as human-readable string
    pub fn uptime_string(&self) -> String {
        let seconds = self.uptime_seconds();
        let days = seconds / 86400;
        let hours = (seconds % 86400) / 3600;
        let minutes = (seconds % 3600) / 60;
        let secs = seconds % 60;

        if days > 0 {
            format!("{}d {}h {}m {}s", days, hours, minutes, secs)
        } else if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, secs)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, secs)
        } else {
            format!("{}s", secs)
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            checkpoints_written: self.checkpoints_written.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
            recoveries_resumed: self.recoveries_resumed.load(Ordering::Relaxed),
            recoveries_restarted: self.recoveries_restarted.load(Ordering::Relaxed),
            success_rate: self.success_rate(),
            avg_run_time_ms: self.avg_run_time_ms(),
            uptime: self.uptime_string(),
        }
    }

    /// Log a summary line, used on shutdown
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            jobs_completed = snapshot.jobs_completed,
            jobs_failed = snapshot.jobs_failed,
            jobs_cancelled = snapshot.jobs_cancelled,
            success_rate = format!("{:.1}%", snapshot.success_rate * 100.0),
            checkpoints_written = snapshot.checkpoints_written,
            recoveries_resumed = snapshot.recoveries_resumed,
            recoveries_restarted = snapshot.recoveries_restarted,
            uptime = %snapshot.uptime,
            "Orchestrator statistics"
        );
    }
}
