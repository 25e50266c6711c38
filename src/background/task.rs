//! Background task record and its terminal transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a background task. Every state but `Running` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl BackgroundStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for BackgroundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Arguments to [`BackgroundManager::launch`](super::BackgroundManager::launch).
#[derive(Debug, Clone, Default)]
pub struct LaunchInput {
    /// Session that owns the task and receives its notification.
    pub parent_session_id: String,
    pub description: String,
    pub prompt: String,
    pub agent: String,
}

/// Work running in an external session on behalf of a parent session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTask {
    pub id: Uuid,
    /// External session doing the work.
    pub session_id: String,
    pub parent_session_id: String,
    pub description: String,
    pub prompt: String,
    pub agent: String,
    pub status: BackgroundStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    /// Set once a poll has seen a non-empty, fully finished todo list.
    #[serde(skip)]
    pub(crate) saw_completed_todos: bool,
}

impl BackgroundTask {
    pub fn new(input: LaunchInput, session_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            parent_session_id: input.parent_session_id,
            description: input.description,
            prompt: input.prompt,
            agent: input.agent,
            status: BackgroundStatus::Running,
            created_at,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            response_text: None,
            saw_completed_todos: false,
        }
    }

    /// Move to a terminal state. Returns `false` if already terminal.
    pub(crate) fn finish(
        &mut self,
        status: BackgroundStatus,
        error: Option<String>,
        response_text: Option<String>,
    ) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.response_text = response_text;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Time since the task started running.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> BackgroundTask {
        BackgroundTask::new(
            LaunchInput {
                parent_session_id: "parent".into(),
                description: "index repo".into(),
                prompt: "go".into(),
                agent: "explore".into(),
            },
            "child",
            Utc::now(),
        )
    }

    #[test]
    fn finish_is_final() {
        let mut t = task();
        assert!(t.finish(BackgroundStatus::Completed, None, Some("done".into())));
        assert!(t.completed_at.is_some());
        assert!(!t.finish(BackgroundStatus::Failed, Some("late".into()), None));
        assert_eq!(t.status, BackgroundStatus::Completed);
        assert_eq!(t.error, None);
    }

    #[test]
    fn finish_rejects_running_target() {
        let mut t = task();
        assert!(!t.finish(BackgroundStatus::Running, None, None));
        assert!(t.completed_at.is_none());
    }

    #[test]
    fn elapsed_never_negative() {
        let t = task();
        let before = t.started_at - chrono::Duration::seconds(5);
        assert_eq!(t.elapsed(before), Duration::ZERO);
    }

    #[test]
    fn serializes_without_internal_flags() {
        let json = serde_json::to_value(task()).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["parentSessionId"], "parent");
        assert!(json.get("sawCompletedTodos").is_none());
        assert!(json.get("error").is_none());
    }
}
