//! Job lifecycle core.
//!
//! Core components:
//! - `state` — Job state machine (Pending → Running → Completed/Failed/Cancelled)
//! - `log` — Append-only per-job log with live subscription
//! - `job` — Job entity, ids and the read model
//! - `runner` — Drives one job through its steps
//! - `manager` — Registry of all jobs, spawning and cancellation

pub mod job;
pub mod log;
pub mod manager;
pub mod runner;
pub mod state;

pub use job::{Job, JobId, JobSnapshot};
pub use log::{JobLog, LogEntry, LogSink};
pub use manager::{JobManager, JobSummary};
pub use runner::{CANCELLED_NOTICE, COMPLETED_NOTICE, JobRunner};
pub use state::JobState;
