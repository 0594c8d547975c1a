use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::Stream;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::instrument;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::api::types::{
    EngineResponse, JobListResponse, JobStatusResponse, SubmitJobRequest, TranscriptResponse,
};
use crate::jobs::JobSnapshot;
use crate::state::AppState;

/// Health check endpoint
#[instrument]
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}

/// Submit a new job
#[instrument(skip(state, req))]
pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<Arc<JobSnapshot>>)> {
    let snapshot = state.orchestrator.submit(&req.audio_path).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// List all jobs
#[instrument(skip(state))]
pub async fn list_jobs(State(state): State<AppState>) -> Json<JobListResponse> {
    let jobs = state.orchestrator.list();
    Json(JobListResponse {
        total: jobs.len(),
        jobs,
    })
}

/// Latest snapshot of one job plus the engine section
#[instrument(skip(state))]
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job_id = parse_job_id(&job_id)?;
    let snapshot = state.orchestrator.status(job_id)?;

    Ok(Json(JobStatusResponse {
        snapshot,
        engine: state.orchestrator.engine_status(),
    }))
}

/// Cancel a job; a terminal job is returned unchanged
#[instrument(skip(state))]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Arc<JobSnapshot>>> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.orchestrator.cancel(job_id).await?))
}

/// Requeue a job from the start
#[instrument(skip(state))]
pub async fn restart_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Arc<JobSnapshot>>> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.orchestrator.restart(job_id).await?))
}

/// Transcript of a COMPLETED job
#[instrument(skip(state))]
pub async fn job_transcript(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<TranscriptResponse>> {
    let job_id = parse_job_id(&job_id)?;
    let transcript = state
        .orchestrator
        .transcript(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no transcript for job {}", job_id)))?;

    Ok(Json(TranscriptResponse {
        job_id,
        segments: transcript.segments,
    }))
}

/// Server-sent stream of a job's snapshots, ending after a terminal one
#[instrument(skip(state))]
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let job_id = parse_job_id(&job_id)?;
    let rx = state.orchestrator.subscribe(job_id)?;
    Ok(Sse::new(snapshot_events(rx)).keep_alive(KeepAlive::default()))
}

/// Engine status, queue depth and counters
#[instrument(skip(state))]
pub async fn engine_status(State(state): State<AppState>) -> ApiResult<Json<EngineResponse>> {
    let orchestrator = &state.orchestrator;
    let checkpoint_storage_bytes = orchestrator.checkpoint_storage_bytes().await?;

    Ok(Json(EngineResponse {
        engine: orchestrator.engine_status(),
        queue_length: orchestrator.queue_len(),
        active_job: orchestrator.active_job(),
        checkpoint_storage_bytes,
        stats: orchestrator.stats().snapshot(),
    }))
}

fn parse_job_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid job id '{}'", raw)))
}

/// Current snapshot first, then every newer one. Intermediate versions may
/// be skipped when the client is slow; the last one is always delivered.
fn snapshot_events(
    rx: watch::Receiver<Arc<JobSnapshot>>,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    futures::stream::unfold((rx, true, false), |(mut rx, first, done)| async move {
        if done {
            return None;
        }
        if !first && rx.changed().await.is_err() {
            return None;
        }

        let snapshot = rx.borrow_and_update().clone();
        let terminal = snapshot.state.is_terminal();
        let event = Event::default()
            .event("snapshot")
            .id(snapshot.version.to_string())
            .json_data(&*snapshot);

        Some((event, (rx, false, terminal)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointConfig;
    use crate::db::create_test_db;
    use crate::engine::SimulatedEngine;
    use crate::jobs::JobState;
    use crate::orchestrator::{Orchestrator, OrchestratorConfig};
    use futures::StreamExt;
    use tempfile::TempDir;

    async fn test_state(dir: &TempDir) -> AppState {
        let config = OrchestratorConfig {
            checkpoint: CheckpointConfig {
                checkpoint_dir: dir.path().join("checkpoints"),
                ..Default::default()
            },
            ..Default::default()
        };
        let orchestrator =
            Orchestrator::open(create_test_db(), Arc::new(SimulatedEngine::fast()), config)
                .await
                .unwrap();
        AppState::new(Arc::new(orchestrator))
    }

    async fn submit(state: &AppState, path: &str) -> Arc<JobSnapshot> {
        let (status, Json(snapshot)) = submit_job(
            State(state.clone()),
            Json(SubmitJobRequest {
                audio_path: path.to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        snapshot
    }

    #[tokio::test]
    async fn test_submit_and_status() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;

        let snapshot = submit(&state, "/audio/interview.wav").await;
        assert_eq!(snapshot.state, JobState::Queued);

        let Json(status) = job_status(State(state.clone()), Path(snapshot.job_id.to_string()))
            .await
            .unwrap();
        assert_eq!(status.snapshot.job_id, snapshot.job_id);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "QUEUED");
        assert!(json["completed_at"].is_null());
        assert!(json["engine"].is_object());
        assert_eq!(json["engine"]["state"], "UNLOADED");
    }

    #[tokio::test]
    async fn test_submit_empty_path_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;

        let result = submit_job(
            State(state),
            Json(SubmitJobRequest {
                audio_path: String::new(),
            }),
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_status_errors() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;

        let bad = job_status(State(state.clone()), Path("not-a-uuid".to_string())).await;
        assert!(matches!(bad, Err(ApiError::BadRequest(_))));

        let missing = job_status(State(state), Path(Uuid::new_v4().to_string())).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let snapshot = submit(&state, "/audio/a.wav").await;
        let id = snapshot.job_id.to_string();

        let Json(first) = cancel_job(State(state.clone()), Path(id.clone()))
            .await
            .unwrap();
        let Json(second) = cancel_job(State(state), Path(id)).await.unwrap();

        assert_eq!(first.state, JobState::Failed);
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn test_restart_queued_is_noop() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let snapshot = submit(&state, "/audio/a.wav").await;

        let Json(after) = restart_job(State(state), Path(snapshot.job_id.to_string()))
            .await
            .unwrap();
        assert_eq!(after.version, snapshot.version);
        assert_eq!(after.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_transcript_not_found_until_completed() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let snapshot = submit(&state, "/audio/a.wav").await;

        let result = job_transcript(State(state), Path(snapshot.job_id.to_string())).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_jobs_in_submission_order() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let a = submit(&state, "/audio/a.wav").await;
        let b = submit(&state, "/audio/b.wav").await;

        let Json(list) = list_jobs(State(state)).await;
        assert_eq!(list.total, 2);
        assert_eq!(list.jobs[0].job_id, a.job_id);
        assert_eq!(list.jobs[1].job_id, b.job_id);
    }

    #[tokio::test]
    async fn test_event_stream_ends_after_terminal_snapshot() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let snapshot = submit(&state, "/audio/a.wav").await;
        state.orchestrator.cancel(snapshot.job_id).await.unwrap();

        let rx = state.orchestrator.subscribe(snapshot.job_id).unwrap();
        let events: Vec<_> = snapshot_events(rx).collect().await;

        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());
    }

    #[tokio::test]
    async fn test_engine_status() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        submit(&state, "/audio/a.wav").await;

        let Json(response) = engine_status(State(state)).await.unwrap();
        assert_eq!(response.queue_length, 1);
        assert!(response.active_job.is_none());
        assert_eq!(response.stats.jobs_completed, 0);
    }
}
