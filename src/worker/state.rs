//! Job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Job is registered but its runner has not started.
    Pending,
    /// Runner is executing steps.
    Running,
    /// Every step finished without error.
    Completed,
    /// Setup or a step failed.
    Failed,
    /// Stopped by a cancellation request.
    Cancelled,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state.
    pub from: JobState,
    /// New state.
    pub to: JobState,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
}

/// Mutable lifecycle record of a job: current state, timestamps and the
/// transitions that led there.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    /// Current state.
    pub state: JobState,
    /// When the job entered RUNNING.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Every transition taken, oldest first.
    pub transitions: Vec<StateTransition>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: JobState::Pending,
            started_at: None,
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state. Returns the rejected pair on an edge the
    /// state machine does not allow.
    pub fn transition_to(&mut self, new_state: JobState) -> Result<(), (JobState, JobState)> {
        if !self.state.can_transition_to(new_state) {
            return Err((self.state, new_state));
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: now,
        });
        self.state = new_state;

        match new_state {
            JobState::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }

        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
