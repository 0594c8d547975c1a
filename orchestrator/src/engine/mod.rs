//! Speech-recognition engine contract
//!
//! The engine is an external collaborator: it loads once, then turns one audio
//! input into diarized segments while reporting progress through a
//! [`ProgressSink`]. The orchestrator never looks inside it.
//!
//! Engines that can restart mid-stream advertise it through
//! [`TranscriptionEngine::supports_resume`]. Everyone else still receives the
//! [`ResumeHint`] and may use it to skip setup work only.

pub mod simulated;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::PartialResult;
use crate::jobs::types::{ErrorKind, Transcript};

pub use simulated::{SimulatedEngine, SimulatedEngineConfig};

/// Errors raised by an engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Engine failed to load: {0}")]
    Load(String),

    #[error("Engine failed during transcription: {0}")]
    Runtime(String),

    #[error("Engine ran out of resources: {0}")]
    ResourceExhausted(String),

    #[error("Engine stopped on cancellation")]
    Cancelled,
}

impl EngineError {
    /// Job error kind this engine error maps to
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Load(_) => ErrorKind::EngineLoadFailure,
            EngineError::Runtime(_) => ErrorKind::EngineRuntimeFailure,
            EngineError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Checkpointed state passed back to the engine when a job is resumed
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeHint {
    pub checkpoint_id: Uuid,
    pub progress: f32,
    pub partial_result: PartialResult,
}

/// One transcription request
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub job_id: Uuid,
    pub audio_path: String,
    pub resume: Option<ResumeHint>,
}

/// A progress report from the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineProgress {
    /// Fraction of the input processed, 0.0..=1.0
    pub progress: f32,
    /// Optional sub-stage description ("running inference", ...)
    pub stage_label: Option<String>,
    /// Partial output worth checkpointing, if the engine has any
    pub partial: Option<PartialResult>,
}

/// Callback handle the engine reports progress through.
///
/// Reports never block the engine; they are queued for the job runner.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<EngineProgress>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report progress. Returns false once nobody is listening anymore.
    pub fn report(&self, update: EngineProgress) -> bool {
        self.tx.send(update).is_ok()
    }

    /// Report a bare progress value with a stage label
    pub fn progress(&self, progress: f32, stage_label: impl Into<String>) -> bool {
        self.report(EngineProgress {
            progress,
            stage_label: Some(stage_label.into()),
            partial: None,
        })
    }
}

/// Trait for speech-recognition + diarization engines (real or simulated)
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Engine name for logs and status output
    fn name(&self) -> &str;

    /// Whether the engine can continue mid-stream from a checkpoint
    fn supports_resume(&self) -> bool;

    /// Load weights and warm up
    async fn load(&self) -> Result<(), EngineError>;

    /// Transcribe one input. Must return promptly once `cancel` fires.
    async fn transcribe(
        &self,
        request: TranscriptionRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Transcript, EngineError>;

    /// Release the loaded model
    async fn unload(&self) -> Result<(), EngineError>;
}
