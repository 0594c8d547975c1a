mod common;

use async_trait::async_trait;
use common::{stepped_engine, wait_for_checkpoint, wait_for_job, Harness};
use orchestrator::engine::{
    EngineError, ProgressSink, SimulatedEngine, TranscriptionEngine, TranscriptionRequest,
};
use orchestrator::jobs::{ErrorKind, JobState, Transcript};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_jobs_run_one_at_a_time_in_fifo_order() {
    let harness = Harness::new();
    let orchestrator = harness.open(stepped_engine(4)).await;
    let mut events = orchestrator.events();

    let mut submitted = Vec::new();
    for name in ["a", "b", "c"] {
        let snapshot = orchestrator
            .submit(&format!("/audio/{}.wav", name))
            .await
            .expect("submit");
        submitted.push(snapshot.job_id);
    }
    orchestrator.start().await.expect("start");

    let mut active = HashSet::new();
    let mut run_order = Vec::new();
    let mut finished = 0;
    while finished < submitted.len() {
        let event = tokio::time::timeout(common::WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let snapshot = &event.snapshot;

        match snapshot.state {
            JobState::LoadingModel => {
                active.insert(snapshot.job_id);
                run_order.push(snapshot.job_id);
            }
            JobState::Running => {
                active.insert(snapshot.job_id);
            }
            JobState::Completed | JobState::Failed => {
                active.remove(&snapshot.job_id);
                finished += 1;
            }
            JobState::Queued => {}
        }
        assert!(active.len() <= 1, "more than one active job: {:?}", active);
    }

    assert_eq!(run_order, submitted);
    for job_id in submitted {
        let snapshot = orchestrator.status(job_id).expect("status");
        assert_eq!(snapshot.state, JobState::Completed);
        assert_eq!(snapshot.progress, 1.0);
    }
    assert_eq!(orchestrator.stats().snapshot().jobs_completed, 3);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_snapshots_never_regress() {
    let harness = Harness::new();
    let orchestrator = harness.open(stepped_engine(10)).await;
    let job = orchestrator.submit("/audio/long.wav").await.expect("submit");
    let mut rx = orchestrator.subscribe(job.job_id).expect("subscribe");
    orchestrator.start().await.expect("start");

    let mut seen = Vec::new();
    loop {
        let snapshot = rx.borrow_and_update().clone();
        let terminal = snapshot.state.is_terminal();
        seen.push(snapshot);
        if terminal {
            break;
        }
        tokio::time::timeout(common::WAIT, rx.changed())
            .await
            .expect("timed out waiting for snapshot")
            .expect("publisher dropped");
    }

    for pair in seen.windows(2) {
        assert!(pair[1].version > pair[0].version);
        assert!(pair[1].progress >= pair[0].progress);
    }
    for snapshot in &seen {
        if snapshot.state != JobState::Completed {
            assert!(snapshot.progress < 1.0);
            assert!(snapshot.completed_at.is_none());
        }
    }
    assert_eq!(seen.last().map(|s| s.state), Some(JobState::Completed));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_job_frees_engine_and_keeps_checkpoint() {
    let harness = Harness::new();
    let engine = stepped_engine(20);
    engine.pause_at(0.5);
    let orchestrator = harness.open(engine.clone()).await;
    orchestrator.start().await.expect("start");

    let first = orchestrator.submit("/audio/first.wav").await.expect("submit");
    let second = orchestrator.submit("/audio/second.wav").await.expect("submit");

    wait_for_job(&orchestrator, first.job_id, |s| s.progress >= 0.5).await;
    let store = harness.checkpoint_store();
    wait_for_checkpoint(&store, first.job_id, 0.5).await;

    let cancelled = orchestrator.cancel(first.job_id).await.expect("cancel");
    assert_eq!(cancelled.state, JobState::Failed);
    assert_eq!(
        cancelled.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Cancelled)
    );

    wait_for_job(&orchestrator, second.job_id, |s| s.state == JobState::Completed).await;

    // Never resumed automatically, checkpoint left in place
    let first_now = orchestrator.status(first.job_id).expect("status");
    assert_eq!(first_now.version, cancelled.version);
    assert!(store.load(first.job_id).await.expect("load").is_some());
    assert_eq!(orchestrator.stats().snapshot().jobs_cancelled, 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancel_queued_job_while_another_runs() {
    let harness = Harness::new();
    let engine = stepped_engine(20);
    engine.pause_at(0.25);
    let orchestrator = harness.open(engine.clone()).await;
    orchestrator.start().await.expect("start");

    let running = orchestrator.submit("/audio/running.wav").await.expect("submit");
    let queued = orchestrator.submit("/audio/queued.wav").await.expect("submit");
    wait_for_job(&orchestrator, running.job_id, |s| s.progress >= 0.25).await;

    let cancelled = orchestrator.cancel(queued.job_id).await.expect("cancel");
    assert_eq!(cancelled.state, JobState::Failed);
    assert!(cancelled.started_at.is_none());
    assert_eq!(
        cancelled.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Cancelled)
    );

    // The engine still belongs to the running job
    assert_eq!(orchestrator.engine_status().active_job, Some(running.job_id));
    assert_eq!(orchestrator.queue_len(), 0);
    assert_eq!(engine.transcribe_calls(), 1);

    engine.release();
    wait_for_job(&orchestrator, running.job_id, |s| s.state == JobState::Completed).await;
    assert_eq!(engine.transcribe_calls(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_restart_completed_job_runs_again() {
    let harness = Harness::new();
    let engine = stepped_engine(5);
    let orchestrator = harness.open(engine.clone()).await;
    orchestrator.start().await.expect("start");

    let job = orchestrator.submit("/audio/a.wav").await.expect("submit");
    let completed =
        wait_for_job(&orchestrator, job.job_id, |s| s.state == JobState::Completed).await;

    let restarted = orchestrator.restart(job.job_id).await.expect("restart");
    assert!(restarted.version > completed.version);
    assert_eq!(restarted.state, JobState::Queued);
    assert_eq!(restarted.progress, 0.0);
    assert!(restarted.completed_at.is_none());

    let again = wait_for_job(&orchestrator, job.job_id, |s| {
        s.state == JobState::Completed && s.version > restarted.version
    })
    .await;
    assert_eq!(again.progress, 1.0);
    assert_eq!(engine.transcribe_calls(), 2);
    assert!(orchestrator
        .transcript(job.job_id)
        .await
        .expect("transcript")
        .is_some());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_restart_running_job_discards_checkpoint_and_reruns() {
    let harness = Harness::new();
    let engine = stepped_engine(20);
    engine.pause_at(0.5);
    let orchestrator = harness.open(engine.clone()).await;
    let mut events = orchestrator.events();
    orchestrator.start().await.expect("start");

    let first = orchestrator.submit("/audio/first.wav").await.expect("submit");
    let second = orchestrator.submit("/audio/second.wav").await.expect("submit");

    let running = wait_for_job(&orchestrator, first.job_id, |s| s.progress >= 0.5).await;
    let store = harness.checkpoint_store();
    wait_for_checkpoint(&store, first.job_id, 0.5).await;

    let restarted = orchestrator.restart(first.job_id).await.expect("restart");
    assert!(restarted.version > running.version);
    assert_eq!(restarted.state, JobState::Queued);
    assert_eq!(restarted.progress, 0.0);
    assert!(restarted.completed_at.is_none());
    assert!(restarted.resumable_checkpoint_id.is_none());
    assert!(store.load(first.job_id).await.expect("load").is_none());

    let mut active = HashSet::new();
    let mut completed = HashSet::new();
    while completed.len() < 2 {
        let event = tokio::time::timeout(common::WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let snapshot = &event.snapshot;

        match snapshot.state {
            JobState::LoadingModel | JobState::Running => {
                active.insert(snapshot.job_id);
            }
            JobState::Queued => {
                active.remove(&snapshot.job_id);
            }
            JobState::Completed => {
                active.remove(&snapshot.job_id);
                completed.insert(snapshot.job_id);
            }
            JobState::Failed => panic!("unexpected failure: {:?}", snapshot.error),
        }
        assert!(active.len() <= 1, "more than one active job: {:?}", active);
    }

    assert!(completed.contains(&first.job_id));
    assert!(completed.contains(&second.job_id));
    assert_eq!(engine.transcribe_calls(), 3);
    assert!(engine.last_resume_hint().is_none());
    assert_eq!(orchestrator.status(first.job_id).expect("status").progress, 1.0);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_load_failure_fails_job_and_retries_in_background() {
    let harness = Harness::new();
    let engine = stepped_engine(3);
    engine.fail_next_loads(1);
    let orchestrator = harness.open(engine.clone()).await;
    orchestrator.start().await.expect("start");

    let first = orchestrator.submit("/audio/first.wav").await.expect("submit");
    let second = orchestrator.submit("/audio/second.wav").await.expect("submit");

    let failed = wait_for_job(&orchestrator, first.job_id, |s| s.state.is_terminal()).await;
    assert_eq!(failed.state, JobState::Failed);
    let error = failed.error.as_ref().expect("failed job carries an error");
    assert_eq!(error.kind, ErrorKind::EngineLoadFailure);
    assert!(!error.message.is_empty());

    let waiting = wait_for_job(&orchestrator, second.job_id, |s| {
        s.stage_label.starts_with("waiting for engine")
    })
    .await;
    assert_eq!(waiting.state, JobState::Queued);
    assert!(waiting.stage_label.contains("simulated weights unavailable"));

    wait_for_job(&orchestrator, second.job_id, |s| s.state == JobState::Completed).await;
    assert!(orchestrator.engine_status().ready);
    assert_eq!(engine.load_calls(), 2);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_watchdog_fails_silent_job() {
    let harness = Harness::new();
    let engine = Arc::new(SimulatedEngine::fast());
    engine.stall_next_run();

    let mut config = harness.config();
    config.runner.watchdog = Duration::from_millis(300);
    let orchestrator = harness.open_with(engine, config).await;
    orchestrator.start().await.expect("start");

    let stalled = orchestrator.submit("/audio/stalled.wav").await.expect("submit");
    let healthy = orchestrator.submit("/audio/healthy.wav").await.expect("submit");

    let failed = wait_for_job(&orchestrator, stalled.job_id, |s| s.state.is_terminal()).await;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));

    wait_for_job(&orchestrator, healthy.job_id, |s| s.state == JobState::Completed).await;

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_engine_runtime_error_fails_job() {
    let harness = Harness::new();
    let engine = stepped_engine(5);
    engine.fail_next_run(EngineError::ResourceExhausted("out of GPU memory".into()));
    let orchestrator = harness.open(engine).await;
    orchestrator.start().await.expect("start");

    let job = orchestrator.submit("/audio/a.wav").await.expect("submit");
    let failed = wait_for_job(&orchestrator, job.job_id, |s| s.state.is_terminal()).await;

    assert_eq!(failed.state, JobState::Failed);
    let error = failed.error.as_ref().expect("error");
    assert_eq!(error.kind, ErrorKind::ResourceExhausted);
    assert!(error.message.contains("out of GPU memory"));
    assert!(failed.completed_at.is_some());
    assert!(failed.progress < 1.0);

    orchestrator.shutdown().await;
}

/// Engine whose transcription panics
struct PanickingEngine;

#[async_trait]
impl TranscriptionEngine for PanickingEngine {
    fn name(&self) -> &str {
        "panicking"
    }

    fn supports_resume(&self) -> bool {
        false
    }

    async fn load(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn transcribe(
        &self,
        _request: TranscriptionRequest,
        _progress: ProgressSink,
        _cancel: CancellationToken,
    ) -> Result<Transcript, EngineError> {
        panic!("decoder blew up");
    }

    async fn unload(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_engine_panic_becomes_runtime_failure() {
    let harness = Harness::new();
    let orchestrator = harness.open(Arc::new(PanickingEngine)).await;
    orchestrator.start().await.expect("start");

    let first = orchestrator.submit("/audio/a.wav").await.expect("submit");
    let second = orchestrator.submit("/audio/b.wav").await.expect("submit");

    for job_id in [first.job_id, second.job_id] {
        let failed = wait_for_job(&orchestrator, job_id, |s| s.state.is_terminal()).await;
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(
            failed.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::EngineRuntimeFailure)
        );
    }
    assert_eq!(orchestrator.queue_len(), 0);

    orchestrator.shutdown().await;
}
