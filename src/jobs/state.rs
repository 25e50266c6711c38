//! Job state machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not yet handed to the dispatcher.
    Pending,
    /// Dispatcher is working on it.
    Running,
    /// Dispatcher resolved with a result.
    Succeeded,
    /// Dispatcher rejected.
    Failed,
    /// Cancelled by its owner.
    Cancelled,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled) |
            (Running, Succeeded) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Input for a new job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    /// Owning session; every read and control call is checked against it.
    pub session_id: String,
    /// Target worker profile, `None` for inline execution.
    pub worker_id: Option<String>,
    pub task: String,
    pub attachments: Vec<PathBuf>,
}

/// A unit of dispatched work.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub worker_id: Option<String>,
    pub task: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<PathBuf>,
    pub session_id: String,
    pub status: JobStatus,
    /// Response text, set iff the job succeeded.
    pub result: Option<String>,
    /// Failure reason, set iff the job failed or was cancelled.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a job in `Running` state.
    pub fn new(input: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            worker_id: input.worker_id,
            task: input.task,
            attachments: input.attachments,
            session_id: input.session_id,
            status: JobStatus::Running,
            result: None,
            error: None,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    /// Move to a terminal state, storing exactly one of result or error.
    ///
    /// Returns `false` without touching the job if the transition is not
    /// allowed, so a late dispatcher result can never overwrite a terminal job.
    pub fn finish(&mut self, outcome: Result<String, String>) -> bool {
        let (target, result, error) = match outcome {
            Ok(text) => (JobStatus::Succeeded, Some(text), None),
            Err(reason) => (JobStatus::Failed, None, Some(reason)),
        };
        self.transition(target, result, error)
    }

    /// Cancel a non-terminal job.
    pub fn cancel(&mut self) -> bool {
        self.transition(
            JobStatus::Cancelled,
            None,
            Some("Task was cancelled".to_string()),
        )
    }

    fn transition(
        &mut self,
        target: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> bool {
        if !self.status.can_transition_to(target) {
            return false;
        }
        self.status = target;
        self.result = result;
        self.error = error;
        if target.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }
}
