//! External session API consumed by the background poller.
//!
//! Each query returns `Ok(None)` when the remote side has no data yet. That
//! is an indeterminate answer, not an empty one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Arguments for creating a child session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub parent_session_id: String,
    pub title: String,
}

/// A freshly created session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    pub id: String,
}

/// A prompt sent to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptRequest {
    pub agent: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub text: String,
}

/// Whether a session is still generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl TodoStatus {
    /// Completed and cancelled items no longer hold a task open.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// One entry of a session's todo list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTodo {
    #[serde(default)]
    pub content: String,
    pub status: TodoStatus,
}

impl SessionTodo {
    pub fn new(content: impl Into<String>, status: TodoStatus) -> Self {
        Self {
            content: content.into(),
            status,
        }
    }
}

/// The session backend that runs background work.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create(&self, request: CreateSessionRequest) -> anyhow::Result<Option<SessionInfo>>;

    async fn prompt(&self, session_id: &str, request: PromptRequest) -> anyhow::Result<()>;

    /// Messages in chronological order.
    async fn messages(&self, session_id: &str) -> anyhow::Result<Option<Vec<SessionMessage>>>;

    async fn status(&self, session_id: &str) -> anyhow::Result<Option<SessionStatus>>;

    async fn todo(&self, session_id: &str) -> anyhow::Result<Option<Vec<SessionTodo>>>;
}

/// Text of the most recent non-empty assistant message.
pub fn last_assistant_text(messages: &[SessionMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant && !m.text.trim().is_empty())
        .map(|m| m.text.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn todo_statuses_deserialize_with_unknown_fallback() {
        let todos: Vec<SessionTodo> = serde_json::from_str(
            r#"[{"content": "a", "status": "in_progress"},
                {"content": "b", "status": "cancelled"},
                {"status": "blocked"}]"#,
        )
        .unwrap();
        assert_eq!(todos[0].status, TodoStatus::InProgress);
        assert!(todos[1].status.is_finished());
        assert_eq!(todos[2].status, TodoStatus::Unknown);
        assert!(!todos[2].status.is_finished());
    }

    #[test]
    fn last_assistant_text_skips_blank_and_user_messages() {
        let messages = vec![
            SessionMessage {
                role: MessageRole::Assistant,
                text: "first".into(),
            },
            SessionMessage {
                role: MessageRole::Assistant,
                text: "final answer".into(),
            },
            SessionMessage {
                role: MessageRole::Assistant,
                text: "  ".into(),
            },
            SessionMessage {
                role: MessageRole::User,
                text: "thanks".into(),
            },
        ];
        assert_eq!(last_assistant_text(&messages).as_deref(), Some("final answer"));
        assert_eq!(last_assistant_text(&[]), None);
    }
}
