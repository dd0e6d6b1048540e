//! Job manager — registry of every job plus the runner task spawned for it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::executor::ExecutorFactory;
use crate::worker::job::{Job, JobId};
use crate::worker::runner::JobRunner;
use crate::worker::state::JobState;

/// Registry contents. Jobs are never removed.
#[derive(Default)]
struct Registry {
    jobs: HashMap<JobId, Arc<Job>>,
    /// Insertion order for listing.
    order: Vec<JobId>,
    /// Runner task handles, taken on shutdown.
    handles: HashMap<JobId, JoinHandle<JobState>>,
}

/// Owns all jobs and spawns one runner task per job.
///
/// Cheap to share behind an `Arc`; every method takes `&self`. Lookups
/// never wait on a running job, only on the brief registry lock.
pub struct JobManager {
    executors: Arc<dyn ExecutorFactory>,
    registry: RwLock<Registry>,
}

impl JobManager {
    pub fn new(executors: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            executors,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Register a new job and start running it in the background.
    ///
    /// Returns as soon as the job is registered; the job is PENDING until
    /// its runner task gets scheduled. An empty step list completes
    /// immediately.
    pub async fn create_job(&self, name: impl Into<String>, steps: Vec<String>) -> JobId {
        let job = Arc::new(Job::new(name, steps.len()));
        let job_id = job.id();
        let executor = self.executors.create(job_id);
        let runner = JobRunner::new(Arc::clone(&job), steps, executor);

        // Hold the write lock across spawn so the handle is registered
        // together with the job.
        let mut registry = self.registry.write().await;
        registry.jobs.insert(job_id, Arc::clone(&job));
        registry.order.push(job_id);
        let handle = tokio::spawn(runner.run());
        registry.handles.insert(job_id, handle);
        drop(registry);

        tracing::info!(job_id = %job_id, name = %job.name(), steps = job.step_count(), "Job created");
        job_id
    }

    pub async fn get_job(&self, job_id: JobId) -> Option<Arc<Job>> {
        self.registry.read().await.jobs.get(&job_id).cloned()
    }

    /// All jobs in creation order.
    pub async fn list_jobs(&self) -> Vec<Arc<Job>> {
        let registry = self.registry.read().await;
        registry
            .order
            .iter()
            .filter_map(|id| registry.jobs.get(id).cloned())
            .collect()
    }

    /// Resolve an operator-typed id (full id or unique prefix).
    pub async fn resolve(&self, input: &str) -> Option<JobId> {
        let registry = self.registry.read().await;
        let mut matches = registry.order.iter().filter(|id| id.matches(input));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Some(*id),
            _ => None,
        }
    }

    /// Request cancellation. Returns false for unknown or finished jobs.
    pub async fn cancel_job(&self, job_id: JobId) -> bool {
        let Some(job) = self.get_job(job_id).await else {
            return false;
        };

        let cancelled = job.request_cancel();
        if cancelled {
            tracing::info!(job_id = %job_id, "Cancellation requested");
        } else {
            tracing::debug!(job_id = %job_id, status = %job.status(), "Cancel ignored, job already finished");
        }
        cancelled
    }

    /// Count of jobs not yet in a terminal state.
    pub async fn active_count(&self) -> usize {
        self.registry
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.status().is_active())
            .count()
    }

    /// Per-status counts across all jobs.
    pub async fn summary(&self) -> JobSummary {
        let registry = self.registry.read().await;

        let mut summary = JobSummary::default();
        for job in registry.jobs.values() {
            match job.status() {
                JobState::Pending => summary.pending += 1,
                JobState::Running => summary.running += 1,
                JobState::Completed => summary.completed += 1,
                JobState::Failed => summary.failed += 1,
                JobState::Cancelled => summary.cancelled += 1,
            }
        }

        summary.total = registry.jobs.len();
        summary
    }

    /// Wait for a job's runner to finish and return its final state.
    ///
    /// Returns `None` for unknown jobs or if the runner was already awaited
    /// (e.g. by `shutdown`).
    pub async fn wait(&self, job_id: JobId) -> Option<JobState> {
        let handle = self.registry.write().await.handles.remove(&job_id)?;
        match handle.await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!(job_id = %job_id, "Runner task failed: {}", e);
                self.get_job(job_id).await.map(|j| j.status())
            }
        }
    }

    /// Cancel every unfinished job and wait for all runners to exit.
    pub async fn shutdown(&self) {
        let (jobs, handles): (Vec<Arc<Job>>, Vec<(JobId, JoinHandle<JobState>)>) = {
            let mut registry = self.registry.write().await;
            let jobs = registry.jobs.values().cloned().collect();
            let handles = registry.handles.drain().collect();
            (jobs, handles)
        };

        let mut signalled = 0;
        for job in &jobs {
            if job.request_cancel() {
                signalled += 1;
            }
        }
        tracing::info!(signalled, runners = handles.len(), "Shutting down job manager");

        let results = join_all(handles.into_iter().map(|(id, h)| async move { (id, h.await) })).await;
        for (job_id, result) in results {
            if let Err(e) = result {
                tracing::error!(job_id = %job_id, "Runner task failed during shutdown: {}", e);
            }
        }
    }
}

/// Summary of all jobs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DryRunFactory;

    fn manager() -> JobManager {
        JobManager::new(Arc::new(DryRunFactory))
    }

    fn steps(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_and_wait() {
        let manager = manager();
        let id = manager.create_job("demo", steps(&["a", "b"])).await;

        assert_eq!(manager.wait(id).await, Some(JobState::Completed));
        let job = manager.get_job(id).await.unwrap();
        assert_eq!(job.name(), "demo");
        assert_eq!(job.status(), JobState::Completed);
        // Second wait finds no handle.
        assert_eq!(manager.wait(id).await, None);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let manager = manager();
        assert!(manager.get_job(JobId::new()).await.is_none());
        assert!(!manager.cancel_job(JobId::new()).await);
        assert_eq!(manager.wait(JobId::new()).await, None);
    }

    #[tokio::test]
    async fn list_preserves_creation_order() {
        let manager = manager();
        let a = manager.create_job("a", steps(&["x"])).await;
        let b = manager.create_job("b", steps(&["x"])).await;
        let c = manager.create_job("c", steps(&["x"])).await;

        let ids: Vec<JobId> = manager.list_jobs().await.iter().map(|j| j.id()).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[tokio::test]
    async fn cancel_finished_job_is_noop() {
        let manager = manager();
        let id = manager.create_job("demo", steps(&["a"])).await;
        manager.wait(id).await;

        let job = manager.get_job(id).await.unwrap();
        let before = job.log().messages();
        assert!(!manager.cancel_job(id).await);
        assert_eq!(job.status(), JobState::Completed);
        assert_eq!(job.log().messages(), before);
    }

    #[tokio::test]
    async fn resolve_short_ids() {
        let manager = manager();
        let id = manager.create_job("demo", steps(&["a"])).await;

        assert_eq!(manager.resolve(&id.short()).await, Some(id));
        assert_eq!(manager.resolve(&id.to_string()).await, Some(id));
        assert_eq!(manager.resolve("zzzz").await, None);
        assert_eq!(manager.resolve("").await, None);
    }

    #[tokio::test]
    async fn summary_counts() {
        let manager = manager();
        let a = manager.create_job("a", steps(&["x"])).await;
        let b = manager.create_job("b", steps(&["y"])).await;
        manager.wait(a).await;
        manager.wait(b).await;

        let summary = manager.summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(manager.active_count().await, 0);
    }
}
