//! Checkpoint module for resuming transcription jobs after a restart
//!
//! A checkpoint captures the last known progress of a RUNNING job together
//! with whatever partial output the engine was able to emit. There is at most
//! one checkpoint per job: each save overwrites the previous one atomically.
//!
//! ## Architecture
//!
//! ```text
//!   JobRunner (RUNNING)
//!         │  save(job_id, attempt, progress, partial)
//!         ▼
//! ┌───────────────────┐        ┌─────────────────────┐
//! │  CheckpointStore  │◄───────│ RecoveryController  │
//! │  • save / write   │  load  │  (startup, read     │
//! │  • load           │        │   only)             │
//! │  • delete         │        └─────────────────────┘
//! └───────────────────┘
//!         │  <dir>/<job_id>.ckpt   (CBOR, tmp + rename)
//!         ▼
//!     filesystem
//! ```

pub mod store;
pub mod types;

pub use store::CheckpointStore;
pub use types::{Checkpoint, CheckpointConfig, CheckpointError, PartialResult};
