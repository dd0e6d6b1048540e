//! Step executors — the collaborators that actually perform workflow steps.
//!
//! The job core only sees the [`StepExecutor`] trait. Each job gets its own
//! executor instance from an [`ExecutorFactory`], so executors may keep
//! per-job state (conversation history, browser sessions) between steps.
//!
//! Provided implementations:
//! - `chat` — LLM agent over an OpenAI-compatible chat completions API,
//!   driving browser tools from an MCP server (`mcp`)
//! - `dry_run` — offline executor that echoes each step

pub mod chat;
pub mod dry_run;
pub mod mcp;

pub use chat::{ChatExecutor, ChatExecutorFactory};
pub use dry_run::{DryRunExecutor, DryRunFactory};
pub use mcp::{McpClient, McpTool, ToolOutput};

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::worker::{JobId, LogSink};

/// Performs workflow steps for a single job.
///
/// Calls may suspend for a long time (network, browser automation). The
/// runner may drop an in-flight future when the job is cancelled, so
/// implementations must tolerate being abandoned mid-call.
#[async_trait]
pub trait StepExecutor: Send {
    /// One-time initialization before the first step.
    async fn setup(&mut self, log: &dyn LogSink) -> Result<(), ExecutorError>;

    /// Perform one step. `index` is 1-based.
    async fn execute_step(
        &mut self,
        index: usize,
        step: &str,
        log: &dyn LogSink,
    ) -> Result<String, ExecutorError>;
}

/// Builds a fresh executor for each job.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, job_id: JobId) -> Box<dyn StepExecutor>;
}

impl<F> ExecutorFactory for F
where
    F: Fn(JobId) -> Box<dyn StepExecutor> + Send + Sync,
{
    fn create(&self, job_id: JobId) -> Box<dyn StepExecutor> {
        self(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::JobLog;

    #[tokio::test]
    async fn closures_are_factories() {
        let factory = |job_id: JobId| -> Box<dyn StepExecutor> { Box::new(DryRunExecutor::new(job_id)) };
        let factory: &dyn ExecutorFactory = &factory;

        let log = JobLog::new();
        let mut exec = factory.create(JobId::new());
        exec.setup(&log).await.unwrap();
        assert_eq!(exec.execute_step(1, "x", &log).await.unwrap(), "dry run: x");
    }
}
