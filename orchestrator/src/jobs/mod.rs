//! Job lifecycle: records, transitions, admission, execution and recovery
//!
//! ```text
//! submit ─► JobQueue ─► AdmissionLoop ──acquire──► ModelResourceManager
//!                              │ admit
//!                              ▼
//!                          JobRunner ──► JobStateMachine ──► ProgressPublisher ─► pollers
//!                                              │
//!                                              ▼
//!                                   SQLite rows + CheckpointStore
//! ```

pub mod publisher;
pub mod queue;
pub mod recovery;
pub mod runner;
pub mod state_machine;
pub mod types;
pub mod version;

pub use publisher::{JobEvent, ProgressPublisher};
pub use queue::{AdmissionLoop, JobQueue};
pub use recovery::{RecoveryConfig, RecoveryController, RecoveryDecision, RecoveryReport, RestartReason};
pub use runner::{JobRunner, RunnerConfig};
pub use state_machine::{JobStateMachine, Transition, MAX_RUNNING_PROGRESS};
pub use types::{ErrorKind, Job, JobError, JobSnapshot, JobState, Segment, Transcript};
