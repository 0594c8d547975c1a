pub mod error;
pub mod routes;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/health", get(routes::health_check))
        // Job endpoints
        .route("/jobs", post(routes::submit_job).get(routes::list_jobs))
        .route("/jobs/:id/status", get(routes::job_status))
        .route("/jobs/:id/cancel", post(routes::cancel_job))
        .route("/jobs/:id/restart", post(routes::restart_job))
        .route("/jobs/:id/transcript", get(routes::job_transcript))
        .route("/jobs/:id/events", get(routes::job_events))
        // Engine endpoint
        .route("/engine", get(routes::engine_status))
        // Attach application state
        .with_state(state)
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
