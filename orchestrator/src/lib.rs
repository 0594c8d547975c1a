//! Transcription job orchestrator
//!
//! Runs long transcription jobs one at a time on a single loaded engine,
//! checkpoints their progress and resumes them after a crash. Pollers read
//! versioned, never-regressing job snapshots.

pub mod api;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod jobs;
pub mod model_manager;
pub mod observability;
pub mod orchestrator;
pub mod state;
pub mod stats;

pub use config::Config;
pub use db::{Database, DbError};
pub use errors::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use state::AppState;
