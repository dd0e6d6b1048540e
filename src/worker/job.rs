//! Job entity and its read model.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;
use crate::worker::log::{JobLog, LogEntry};
use crate::worker::runner::CANCELLED_NOTICE;
use crate::worker::state::{JobState, Lifecycle};

/// Length of the short id shown to operators.
pub const SHORT_ID_LEN: usize = 8;

/// Opaque job identifier, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First hex characters of the id, for display in tables.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..SHORT_ID_LEN].to_string()
    }

    /// Whether an operator-typed id (full or abbreviated) refers to this job.
    pub fn matches(&self, input: &str) -> bool {
        let input = input.trim().to_ascii_lowercase();
        if input.is_empty() {
            return false;
        }
        self.0.simple().to_string().starts_with(&input.replace('-', ""))
            || self.0.hyphenated().to_string() == input
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One tracked execution of a workflow.
///
/// Status and log are written only by the job's runner; the cancel token is
/// the one field the manager touches from outside the runner task.
pub struct Job {
    id: JobId,
    name: String,
    step_count: usize,
    created_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
    log: JobLog,
    cancel: CancellationToken,
}

impl Job {
    /// Create a pending job.
    pub fn new(name: impl Into<String>, step_count: usize) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            step_count,
            created_at: Utc::now(),
            lifecycle: Mutex::new(Lifecycle::new()),
            log: JobLog::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> JobState {
        self.lifecycle().state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle().finished_at
    }

    /// States this job has passed through, oldest first.
    pub fn history(&self) -> Vec<JobState> {
        let lc = self.lifecycle();
        let mut states = vec![JobState::Pending];
        states.extend(lc.transitions.iter().map(|t| t.to));
        states
    }

    pub fn log(&self) -> &JobLog {
        &self.log
    }

    /// Follow log entries appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.log.subscribe()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal the cancel handle if the job has not reached a terminal state.
    ///
    /// Returns false (and leaves the job untouched) once terminal.
    pub fn request_cancel(&self) -> bool {
        let lc = self.lifecycle();
        if lc.state.is_terminal() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let lc = self.lifecycle().clone();
        JobSnapshot {
            id: self.id,
            name: self.name.clone(),
            status: lc.state,
            step_count: self.step_count,
            created_at: self.created_at,
            started_at: lc.started_at,
            finished_at: lc.finished_at,
            log: self.log.snapshot(),
        }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Move PENDING -> RUNNING.
    pub(crate) fn start(&self) -> Result<(), JobError> {
        self.transition(JobState::Running)
    }

    /// Append the final log line and write the terminal state.
    ///
    /// A completion that races a cancel request resolves to CANCELLED, so a
    /// cancel that returned true never ends in COMPLETED.
    pub(crate) fn finish(&self, state: JobState, message: String) -> Result<JobState, JobError> {
        let mut lc = self.lifecycle();
        let (state, message) = if state == JobState::Completed && self.cancel.is_cancelled() {
            (JobState::Cancelled, CANCELLED_NOTICE.to_string())
        } else {
            (state, message)
        };

        if !lc.state.can_transition_to(state) {
            return Err(self.invalid(lc.state, state));
        }
        self.log.push(message);
        lc.transition_to(state).map_err(|(from, to)| self.invalid(from, to))?;
        Ok(state)
    }

    fn transition(&self, to: JobState) -> Result<(), JobError> {
        self.lifecycle()
            .transition_to(to)
            .map_err(|(from, to)| self.invalid(from, to))
    }

    fn invalid(&self, from: JobState, to: JobState) -> JobError {
        JobError::InvalidTransition {
            id: self.id,
            from,
            to,
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("log_len", &self.log.len())
            .finish()
    }
}

/// Point-in-time view of a job for display.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    /// Job identifier.
    pub id: JobId,
    /// Workflow name the job was started from.
    pub name: String,
    /// Status at the time of the snapshot.
    pub status: JobState,
    /// Number of steps in the workflow.
    pub step_count: usize,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the runner started it.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Log entries written so far.
    pub log: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending() {
        let job = Job::new("demo", 2);
        assert_eq!(job.status(), JobState::Pending);
        assert_eq!(job.name(), "demo");
        assert_eq!(job.step_count(), 2);
        assert!(job.log().is_empty());
        assert!(job.started_at().is_none());
    }

    #[test]
    fn ids_are_unique() {
        let a = Job::new("a", 1);
        let b = Job::new("b", 1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn short_id_matches_prefix() {
        let id = JobId::new();
        let short = id.short();
        assert_eq!(short.len(), SHORT_ID_LEN);
        assert!(id.matches(&short));
        assert!(id.matches(&short.to_uppercase()));
        assert!(id.matches(&id.to_string()));
        assert!(!id.matches(""));
    }

    #[test]
    fn job_id_parses_full_uuid() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn finish_writes_log_before_state() {
        let job = Job::new("demo", 0);
        job.start().unwrap();
        let state = job
            .finish(JobState::Failed, "Critical Failure: boom".to_string())
            .unwrap();

        assert_eq!(state, JobState::Failed);
        assert_eq!(job.status(), JobState::Failed);
        assert_eq!(job.log().messages(), vec!["Critical Failure: boom"]);
        assert!(job.finished_at().is_some());
    }

    #[test]
    fn completion_after_cancel_request_resolves_to_cancelled() {
        let job = Job::new("demo", 0);
        job.start().unwrap();
        assert!(job.request_cancel());

        let state = job
            .finish(JobState::Completed, "done".to_string())
            .unwrap();
        assert_eq!(state, JobState::Cancelled);
        assert_eq!(job.log().messages(), vec![CANCELLED_NOTICE]);
    }

    #[test]
    fn cancel_after_terminal_is_noop() {
        let job = Job::new("demo", 0);
        job.start().unwrap();
        job.finish(JobState::Completed, "done".to_string()).unwrap();

        assert!(!job.request_cancel());
        assert!(!job.is_cancel_requested());
        assert_eq!(job.status(), JobState::Completed);
        assert_eq!(job.log().len(), 1);
    }

    #[test]
    fn second_finish_is_rejected() {
        let job = Job::new("demo", 0);
        job.start().unwrap();
        job.finish(JobState::Completed, "done".to_string()).unwrap();

        let err = job.finish(JobState::Failed, "late".to_string()).unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidTransition {
                from: JobState::Completed,
                to: JobState::Failed,
                ..
            }
        ));
        assert_eq!(job.log().len(), 1);
    }

    #[test]
    fn history_lists_visited_states() {
        let job = Job::new("demo", 0);
        job.start().unwrap();
        job.finish(JobState::Completed, "done".to_string()).unwrap();
        assert_eq!(
            job.history(),
            vec![JobState::Pending, JobState::Running, JobState::Completed]
        );
    }

    #[test]
    fn snapshot_serializes() {
        let job = Job::new("demo", 1);
        job.log().push("hello");
        let snap = job.snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["name"], "demo");
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["log"][0]["message"], "hello");
    }
}
