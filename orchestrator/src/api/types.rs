use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::jobs::{JobSnapshot, Segment};
use crate::model_manager::EngineStatus;
use crate::stats::StatsSnapshot;

/// Request to submit a new transcription job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    /// Path or URI of the audio input
    pub audio_path: String,
}

/// Job status as served to pollers: the snapshot fields plus the engine
/// section at the top level
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusResponse {
    #[serde(flatten)]
    pub snapshot: Arc<JobSnapshot>,
    pub engine: EngineStatus,
}

/// All jobs, oldest submission first
#[derive(Debug, Clone, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Arc<JobSnapshot>>,
    pub total: usize,
}

/// Final transcript of a COMPLETED job
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptResponse {
    pub job_id: Uuid,
    pub segments: Vec<Segment>,
}

/// Engine status and orchestrator counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineResponse {
    pub engine: EngineStatus,
    pub queue_length: usize,
    pub active_job: Option<Uuid>,
    pub checkpoint_storage_bytes: u64,
    pub stats: StatsSnapshot,
}
