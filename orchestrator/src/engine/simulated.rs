//! # Simulated Engine
//!
//! Stands in for a real speech-recognition + diarization engine. It produces
//! one synthetic segment per step, alternating speakers, and reports progress
//! and partial results the same way a real engine would.
//!
//! Besides serving as the default engine of the binary, it carries the hooks
//! scenario tests need: load failures, a runtime failure, a pause gate that
//! holds a job at a given progress, and a stall that stops progress reports
//! entirely.
//!
//! | Aspect   | Simulated                        | Real engine                 |
//! |----------|----------------------------------|-----------------------------|
//! | Load     | Sleeps `load_delay`              | Loads weights               |
//! | Segments | Synthetic text, two speakers     | Actual speech              |
//! | Resume   | Skips finished steps if enabled  | Engine-dependent            |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    EngineError, EngineProgress, ProgressSink, ResumeHint, TranscriptionEngine,
    TranscriptionRequest,
};
use crate::checkpoint::PartialResult;
use crate::jobs::types::{Segment, Transcript};

/// Seconds of audio each simulated step accounts for
const SEGMENT_SECS: f64 = 5.0;

/// Configuration for the simulated engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedEngineConfig {
    /// Number of progress steps per job
    pub steps: u32,
    /// Delay between steps in milliseconds
    pub step_delay_ms: u64,
    /// Delay of a model load in milliseconds
    pub load_delay_ms: u64,
    /// Whether the engine continues from a checkpoint mid-stream
    pub supports_resume: bool,
}

impl Default for SimulatedEngineConfig {
    fn default() -> Self {
        Self {
            steps: 20,
            step_delay_ms: 250,
            load_delay_ms: 500,
            supports_resume: true,
        }
    }
}

/// Simulated transcription engine
pub struct SimulatedEngine {
    config: SimulatedEngineConfig,
    loaded: AtomicBool,
    load_failures: AtomicU32,
    run_failure: Mutex<Option<EngineError>>,
    pause_at: Mutex<Option<f32>>,
    gate: Notify,
    stall_next: AtomicBool,
    load_calls: AtomicU32,
    transcribe_calls: AtomicU32,
    resume_hints: Mutex<Vec<Option<ResumeHint>>>,
}

impl SimulatedEngine {
    pub fn new(config: SimulatedEngineConfig) -> Self {
        Self {
            config,
            loaded: AtomicBool::new(false),
            load_failures: AtomicU32::new(0),
            run_failure: Mutex::new(None),
            pause_at: Mutex::new(None),
            gate: Notify::new(),
            stall_next: AtomicBool::new(false),
            load_calls: AtomicU32::new(0),
            transcribe_calls: AtomicU32::new(0),
            resume_hints: Mutex::new(Vec::new()),
        }
    }

    /// Fast engine for tests: a few short steps, instant load
    pub fn fast() -> Self {
        Self::new(SimulatedEngineConfig {
            steps: 5,
            step_delay_ms: 10,
            load_delay_ms: 0,
            supports_resume: true,
        })
    }

    /// Make the next `n` loads fail
    pub fn fail_next_loads(&self, n: u32) {
        self.load_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next transcription fail after its first step
    pub fn fail_next_run(&self, error: EngineError) {
        *lock(&self.run_failure) = Some(error);
    }

    /// Hold the next transcription once it reaches `progress`, until [`release`](Self::release)
    pub fn pause_at(&self, progress: f32) {
        *lock(&self.pause_at) = Some(progress);
    }

    /// Let a paused transcription continue
    pub fn release(&self) {
        self.gate.notify_one();
    }

    /// Make the next transcription stop reporting progress until cancelled
    pub fn stall_next_run(&self) {
        self.stall_next.store(true, Ordering::SeqCst);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> u32 {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn transcribe_calls(&self) -> u32 {
        self.transcribe_calls.load(Ordering::SeqCst)
    }

    /// Resume hint received by the most recent transcription
    pub fn last_resume_hint(&self) -> Option<ResumeHint> {
        lock(&self.resume_hints).last().cloned().flatten()
    }

    fn synthetic_segment(step: u32) -> Segment {
        let start = (step - 1) as f64 * SEGMENT_SECS;
        Segment {
            start,
            end: start + SEGMENT_SECS,
            speaker: Some(format!("SPEAKER_{:02}", (step - 1) % 2)),
            text: format!("simulated utterance {}", step),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl TranscriptionEngine for SimulatedEngine {
    fn name(&self) -> &str {
        "simulated"
    }

    fn supports_resume(&self) -> bool {
        self.config.supports_resume
    }

    async fn load(&self) -> Result<(), EngineError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.config.load_delay_ms)).await;

        let remaining = self.load_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.load_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Load("simulated weights unavailable".to_string()));
        }

        self.loaded.store(true, Ordering::SeqCst);
        info!(engine = "simulated", "Model loaded");
        Ok(())
    }

    async fn transcribe(
        &self,
        request: TranscriptionRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Transcript, EngineError> {
        if !self.is_loaded() {
            return Err(EngineError::Runtime("model not loaded".to_string()));
        }

        self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.resume_hints).push(request.resume.clone());

        let steps = self.config.steps.max(1);
        let (first_step, mut segments) = match (&request.resume, self.config.supports_resume) {
            (Some(hint), true) => {
                let done = (hint.progress * steps as f32).floor() as u32;
                (done.min(steps), hint.partial_result.segments.clone())
            }
            _ => (0, Vec::new()),
        };

        debug!(
            job_id = %request.job_id,
            audio_path = %request.audio_path,
            first_step = first_step,
            "Simulated transcription started"
        );
        progress.progress(first_step as f32 / steps as f32, "loading audio");

        let run_failure = lock(&self.run_failure).take();
        let stall = self.stall_next.swap(false, Ordering::SeqCst);

        for step in (first_step + 1)..=steps {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(self.config.step_delay_ms)) => {}
            }

            if stall {
                cancel.cancelled().await;
                return Err(EngineError::Cancelled);
            }

            segments.push(Self::synthetic_segment(step));
            let fraction = step as f32 / steps as f32;
            progress.report(EngineProgress {
                progress: fraction,
                stage_label: Some("running inference".to_string()),
                partial: Some(PartialResult {
                    segments: segments.clone(),
                    processed_until_secs: step as f64 * SEGMENT_SECS,
                    engine_state: Some(step.to_le_bytes().to_vec()),
                }),
            });

            if let Some(error) = run_failure.clone() {
                return Err(error);
            }

            let pause = {
                let mut pause_at = lock(&self.pause_at);
                match *pause_at {
                    Some(threshold) if fraction >= threshold => {
                        *pause_at = None;
                        true
                    }
                    _ => false,
                }
            };
            if pause {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = self.gate.notified() => {}
                }
            }
        }

        progress.progress(1.0, "merging speaker labels");
        Ok(Transcript { segments })
    }

    async fn unload(&self) -> Result<(), EngineError> {
        self.loaded.store(false, Ordering::SeqCst);
        info!(engine = "simulated", "Model unloaded");
        Ok(())
    }
}
