//! Error types for agent-jobs.

use std::time::Duration;

use crate::worker::{JobId, JobState};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a step executor.
///
/// These never leave the runner: they become a terminal job status plus a
/// log line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("{0}")]
    Init(String),

    #[error("step {index} failed: {cause}")]
    Step { index: usize, cause: String },

    #[error("cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// Build a step failure for the given 1-based step index.
    pub fn step(index: usize, cause: impl Into<String>) -> Self {
        Self::Step {
            index,
            cause: cause.into(),
        }
    }
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} already in state {from}, cannot transition to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
}

/// Workflow source errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflows: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse workflows: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Workflow {name} has no steps")]
    Empty { name: String },
}

/// Tool server errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Failed to start tool server {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tool server closed the connection")]
    Closed,

    #[error("Invalid message from tool server: {0}")]
    Protocol(String),

    #[error("Tool server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Tool server request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
