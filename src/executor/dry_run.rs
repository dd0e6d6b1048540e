//! Offline executor that echoes each step.

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::executor::{ExecutorFactory, StepExecutor};
use crate::worker::{JobId, LogSink};

pub struct DryRunExecutor {
    job_id: JobId,
}

impl DryRunExecutor {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }
}

#[async_trait]
impl StepExecutor for DryRunExecutor {
    async fn setup(&mut self, log: &dyn LogSink) -> Result<(), ExecutorError> {
        tracing::debug!(job_id = %self.job_id, "Dry-run executor ready");
        log.append("Dry-run executor ready (no actions will be performed).".to_string());
        Ok(())
    }

    async fn execute_step(
        &mut self,
        _index: usize,
        step: &str,
        _log: &dyn LogSink,
    ) -> Result<String, ExecutorError> {
        Ok(format!("dry run: {step}"))
    }
}

/// Factory for [`DryRunExecutor`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunFactory;

impl ExecutorFactory for DryRunFactory {
    fn create(&self, job_id: JobId) -> Box<dyn StepExecutor> {
        Box::new(DryRunExecutor::new(job_id))
    }
}
