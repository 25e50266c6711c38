//! Terminal-transition notifications for background tasks.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::background::task::{BackgroundStatus, BackgroundTask};

/// Sent once when a background task reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNotification {
    pub task_id: Uuid,
    pub session_id: String,
    pub parent_session_id: String,
    pub status: BackgroundStatus,
    /// Short human-readable line, suitable for a toast.
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskNotification {
    pub fn from_task(task: &BackgroundTask) -> Self {
        let summary = match (task.status, task.error.as_deref()) {
            (BackgroundStatus::Completed, _) => {
                format!("Background task \"{}\" completed", task.description)
            }
            (status, Some(error)) => {
                format!("Background task \"{}\" {status}: {error}", task.description)
            }
            (status, None) => format!("Background task \"{}\" {status}", task.description),
        };
        Self {
            task_id: task.id,
            session_id: task.session_id.clone(),
            parent_session_id: task.parent_session_id.clone(),
            status: task.status,
            summary,
            response_text: task.response_text.clone(),
            error: task.error.clone(),
        }
    }
}

/// Receives background task notifications. Failures are logged by the caller
/// and never change task state.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &TaskNotification) -> anyhow::Result<()>;
}
