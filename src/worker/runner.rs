//! Drives one job from PENDING to a terminal state.
//!
//! Cancellation is cooperative. The token is checked before setup and before
//! every step; an in-flight `setup`/`execute_step` future is also raced
//! against the token and dropped when it fires. A panicking executor is
//! caught and recorded as a failure like any other executor error.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecutorError, JobError};
use crate::executor::StepExecutor;
use crate::worker::job::Job;
use crate::worker::state::JobState;

/// Log line written when a job stops because of a cancel request.
pub const CANCELLED_NOTICE: &str = "Job was cancelled by user.";

/// Log line written when every step succeeded.
pub const COMPLETED_NOTICE: &str = "Workflow completed successfully.";

/// Executes the steps of exactly one job.
pub struct JobRunner {
    job: Arc<Job>,
    steps: Vec<String>,
    executor: Box<dyn StepExecutor>,
    cancel: CancellationToken,
}

impl JobRunner {
    pub fn new(job: Arc<Job>, steps: Vec<String>, executor: Box<dyn StepExecutor>) -> Self {
        let cancel = job.cancel_token();
        Self {
            job,
            steps,
            executor,
            cancel,
        }
    }

    /// Run to completion. Consumes the runner, so a job is run at most once.
    ///
    /// Executor failures never escape: they end up in the job's status and
    /// log. The returned state is the terminal state written.
    pub async fn run(mut self) -> JobState {
        let job_id = self.job.id();
        tracing::info!(job_id = %job_id, name = %self.job.name(), steps = self.steps.len(), "Job starting");

        let outcome = match self.job.start() {
            Ok(()) => self.drive().await,
            Err(e) => {
                // Only reachable if the job was handed to a second runner.
                tracing::error!(job_id = %job_id, "Refusing to run job: {}", e);
                return self.job.status();
            }
        };

        let (state, message) = match outcome {
            Ok(()) => (JobState::Completed, COMPLETED_NOTICE.to_string()),
            Err(ExecutorError::Cancelled) => (JobState::Cancelled, CANCELLED_NOTICE.to_string()),
            Err(ExecutorError::Init(cause)) => {
                (JobState::Failed, format!("Critical Failure: {cause}"))
            }
            Err(ExecutorError::Step { index, cause }) => {
                (JobState::Failed, format!("Error on step {index}: {cause}"))
            }
        };

        match self.job.finish(state, message) {
            Ok(final_state) => {
                match final_state {
                    JobState::Completed => tracing::info!(job_id = %job_id, "Job completed"),
                    JobState::Cancelled => tracing::info!(job_id = %job_id, "Job cancelled"),
                    _ => tracing::warn!(job_id = %job_id, state = %final_state, "Job failed"),
                }
                final_state
            }
            Err(e @ JobError::InvalidTransition { .. }) => {
                tracing::error!(job_id = %job_id, "Failed to record terminal state: {}", e);
                self.job.status()
            }
        }
    }

    async fn drive(&mut self) -> Result<(), ExecutorError> {
        let job = Arc::clone(&self.job);
        let log = job.log();

        self.checkpoint()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ExecutorError::Cancelled),
            res = AssertUnwindSafe(self.executor.setup(log)).catch_unwind() => {
                res.unwrap_or_else(|panic| Err(ExecutorError::Init(panic_message(panic))))?
            }
        }

        for (i, step) in self.steps.iter().enumerate() {
            let index = i + 1;
            if self.cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }

            log.push(format!("Step {index}: {step}"));
            tracing::debug!(job_id = %job.id(), step = index, "Executing step");

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ExecutorError::Cancelled),
                res = AssertUnwindSafe(self.executor.execute_step(index, step, log)).catch_unwind() => {
                    res.unwrap_or_else(|panic| Err(ExecutorError::step(index, panic_message(panic))))
                }
            };

            match result {
                Ok(output) => log.push(format!("Result: {output}")),
                // An executor aborting because we cancelled it is a cancellation.
                Err(_) if self.cancel.is_cancelled() => return Err(ExecutorError::Cancelled),
                Err(ExecutorError::Step { cause, .. }) => {
                    return Err(ExecutorError::Step { index, cause });
                }
                Err(ExecutorError::Init(cause)) => {
                    return Err(ExecutorError::Step { index, cause });
                }
                Err(ExecutorError::Cancelled) => return Err(ExecutorError::Cancelled),
            }
        }

        Ok(())
    }

    fn checkpoint(&self) -> Result<(), ExecutorError> {
        if self.cancel.is_cancelled() {
            Err(ExecutorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("executor panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::worker::LogSink;

    /// Executor driven by a script of per-step results.
    struct Scripted {
        setup: Result<(), ExecutorError>,
        results: Vec<Result<String, ExecutorError>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StepExecutor for Scripted {
        async fn setup(&mut self, _log: &dyn LogSink) -> Result<(), ExecutorError> {
            self.setup.clone()
        }

        async fn execute_step(
            &mut self,
            index: usize,
            step: &str,
            _log: &dyn LogSink,
        ) -> Result<String, ExecutorError> {
            self.calls.lock().unwrap().push(step.to_string());
            self.results[index - 1].clone()
        }
    }

    fn runner(
        steps: &[&str],
        setup: Result<(), ExecutorError>,
        results: Vec<Result<String, ExecutorError>>,
    ) -> (Arc<Job>, JobRunner, Arc<Mutex<Vec<String>>>) {
        let job = Arc::new(Job::new("test", steps.len()));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let exec = Scripted {
            setup,
            results,
            calls: calls.clone(),
        };
        let steps = steps.iter().map(|s| s.to_string()).collect();
        let runner = JobRunner::new(job.clone(), steps, Box::new(exec));
        (job, runner, calls)
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let (job, runner, _) = runner(
            &["open page", "click button"],
            Ok(()),
            vec![Ok("opened".into()), Ok("clicked".into())],
        );

        assert_eq!(runner.run().await, JobState::Completed);
        assert_eq!(
            job.log().messages(),
            vec![
                "Step 1: open page",
                "Result: opened",
                "Step 2: click button",
                "Result: clicked",
                COMPLETED_NOTICE,
            ]
        );
        assert_eq!(
            job.history(),
            vec![JobState::Pending, JobState::Running, JobState::Completed]
        );
    }

    #[tokio::test]
    async fn failing_step_stops_execution() {
        let (job, runner, calls) = runner(
            &["a", "b", "c"],
            Ok(()),
            vec![
                Ok("A".into()),
                Err(ExecutorError::step(2, "timeout")),
                Ok("C".into()),
            ],
        );

        assert_eq!(runner.run().await, JobState::Failed);
        assert_eq!(
            job.log().messages(),
            vec!["Step 1: a", "Result: A", "Step 2: b", "Error on step 2: timeout"]
        );
        assert_eq!(*calls.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn setup_failure_is_critical() {
        let (job, runner, calls) = runner(
            &["a"],
            Err(ExecutorError::Init("browser did not start".into())),
            vec![Ok("A".into())],
        );

        assert_eq!(runner.run().await, JobState::Failed);
        assert_eq!(
            job.log().messages(),
            vec!["Critical Failure: browser did not start"]
        );
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_steps_complete_immediately() {
        let (job, runner, _) = runner(&[], Ok(()), vec![]);
        assert_eq!(runner.run().await, JobState::Completed);
        assert_eq!(job.log().messages(), vec![COMPLETED_NOTICE]);
    }

    #[tokio::test]
    async fn cancel_before_start_runs_nothing() {
        let (job, runner, calls) = runner(&["a", "b"], Ok(()), vec![Ok("A".into()), Ok("B".into())]);
        assert!(job.request_cancel());

        assert_eq!(runner.run().await, JobState::Cancelled);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(job.log().messages(), vec![CANCELLED_NOTICE]);
        assert_eq!(
            job.history(),
            vec![JobState::Pending, JobState::Running, JobState::Cancelled]
        );
    }

    #[tokio::test]
    async fn executor_reported_cancellation() {
        let (job, runner, _) = runner(
            &["a", "b"],
            Ok(()),
            vec![Ok("A".into()), Err(ExecutorError::Cancelled)],
        );

        assert_eq!(runner.run().await, JobState::Cancelled);
        assert_eq!(
            job.log().messages(),
            vec!["Step 1: a", "Result: A", "Step 2: b", CANCELLED_NOTICE]
        );
    }

    /// Blocks in `execute_step` until dropped.
    struct Hanging;

    #[async_trait]
    impl StepExecutor for Hanging {
        async fn setup(&mut self, _log: &dyn LogSink) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn execute_step(
            &mut self,
            _index: usize,
            _step: &str,
            _log: &dyn LogSink,
        ) -> Result<String, ExecutorError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn in_flight_step_is_aborted_on_cancel() {
        let job = Arc::new(Job::new("hang", 2));
        let runner = JobRunner::new(
            job.clone(),
            vec!["wait".to_string(), "never".to_string()],
            Box::new(Hanging),
        );
        let handle = tokio::spawn(runner.run());

        while job.log().len() < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(job.status(), JobState::Running);
        assert!(job.request_cancel());

        let state = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, JobState::Cancelled);
        assert_eq!(job.log().messages(), vec!["Step 1: wait", CANCELLED_NOTICE]);
    }

    /// Never finishes `setup`.
    struct StuckSetup {
        steps_run: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl StepExecutor for StuckSetup {
        async fn setup(&mut self, log: &dyn LogSink) -> Result<(), ExecutorError> {
            log.append("Initializing agent...".to_string());
            std::future::pending().await
        }

        async fn execute_step(
            &mut self,
            _index: usize,
            step: &str,
            _log: &dyn LogSink,
        ) -> Result<String, ExecutorError> {
            *self.steps_run.lock().unwrap() += 1;
            Ok(step.to_string())
        }
    }

    #[tokio::test]
    async fn cancel_during_setup_runs_no_steps() {
        let job = Arc::new(Job::new("stuck", 2));
        let steps_run = Arc::new(Mutex::new(0));
        let runner = JobRunner::new(
            job.clone(),
            vec!["a".to_string(), "b".to_string()],
            Box::new(StuckSetup {
                steps_run: steps_run.clone(),
            }),
        );
        let handle = tokio::spawn(runner.run());

        while job.log().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(job.status(), JobState::Running);
        assert!(job.request_cancel());

        let state = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, JobState::Cancelled);
        assert_eq!(*steps_run.lock().unwrap(), 0);
        assert_eq!(
            job.log().messages(),
            vec!["Initializing agent...", CANCELLED_NOTICE]
        );
        assert!(!job.log().messages().iter().any(|m| m.starts_with("Step ")));
    }

    /// Panics in whichever call the test picks.
    struct Panicking {
        in_setup: bool,
    }

    #[async_trait]
    impl StepExecutor for Panicking {
        async fn setup(&mut self, _log: &dyn LogSink) -> Result<(), ExecutorError> {
            if self.in_setup {
                panic!("driver crashed");
            }
            Ok(())
        }

        async fn execute_step(
            &mut self,
            index: usize,
            _step: &str,
            _log: &dyn LogSink,
        ) -> Result<String, ExecutorError> {
            if index == 2 {
                panic!("index out of range: {index}");
            }
            Ok("fine".to_string())
        }
    }

    #[tokio::test]
    async fn panic_in_setup_is_critical_failure() {
        let job = Arc::new(Job::new("panic", 1));
        let runner = JobRunner::new(
            job.clone(),
            vec!["a".to_string()],
            Box::new(Panicking { in_setup: true }),
        );

        assert_eq!(runner.run().await, JobState::Failed);
        assert_eq!(
            job.log().messages(),
            vec!["Critical Failure: executor panicked: driver crashed"]
        );
    }

    #[tokio::test]
    async fn panic_in_step_fails_that_step() {
        let job = Arc::new(Job::new("panic", 3));
        let runner = JobRunner::new(
            job.clone(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            Box::new(Panicking { in_setup: false }),
        );

        assert_eq!(runner.run().await, JobState::Failed);
        assert_eq!(
            job.log().messages(),
            vec![
                "Step 1: a",
                "Result: fine",
                "Step 2: b",
                "Error on step 2: executor panicked: index out of range: 2",
            ]
        );
    }
}
