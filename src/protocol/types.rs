//! Request and response payloads for the task protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::JobOutcome;

/// Where a task runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Handled directly by the dispatcher.
    #[default]
    Inline,
    /// Routed to a named worker from the pool.
    Worker,
}

/// Arguments to `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStartRequest {
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub task: String,
    /// Paths relative to (or inside) the attachment root.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Spawn the worker if it is not running. Defaults to `true`.
    #[serde(default)]
    pub auto_spawn: Option<bool>,
}

impl TaskStartRequest {
    pub fn inline(task: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Inline,
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn worker(worker_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Worker,
            worker_id: Some(worker_id.into()),
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_auto_spawn(mut self, auto_spawn: bool) -> Self {
        self.auto_spawn = Some(auto_spawn);
        self
    }
}

/// What `list` enumerates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListView {
    /// The requester's jobs.
    #[default]
    Tasks,
    /// Worker instances in the pool.
    Workers,
}

/// How `list` renders its output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFormat {
    #[default]
    Markdown,
    Json,
}

/// Outcome of every protocol operation. Failures are data, never panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResponse {
    #[serde(rename_all = "camelCase")]
    Pending { task_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Running { task_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Succeeded { task_id: Uuid, response_text: String },
    /// Validation, configuration, timeout, or dispatch failure.
    #[serde(rename_all = "camelCase")]
    Failed {
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<Uuid>,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled { task_id: Uuid },
    /// Echoes back only the id the caller supplied.
    #[serde(rename_all = "camelCase")]
    Forbidden { task_id: String },
    #[serde(rename = "ok")]
    Listed {
        view: ListView,
        format: ListFormat,
        count: usize,
        output: String,
    },
}

impl TaskResponse {
    /// A failure that never reached the registry.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self::Failed {
            task_id: None,
            error: error.into(),
        }
    }

    /// The wire `status` tag.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Running { .. } => "running",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Forbidden { .. } => "forbidden",
            Self::Listed { .. } => "ok",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::Pending { task_id }
            | Self::Running { task_id }
            | Self::Succeeded { task_id, .. }
            | Self::Cancelled { task_id } => Some(*task_id),
            Self::Failed { task_id, .. } => *task_id,
            Self::Forbidden { task_id } => task_id.parse().ok(),
            Self::Listed { .. } => None,
        }
    }
}

impl From<JobOutcome> for TaskResponse {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Pending { task_id } => Self::Pending { task_id },
            JobOutcome::Running { task_id } => Self::Running { task_id },
            JobOutcome::Succeeded {
                task_id,
                response_text,
            } => Self::Succeeded {
                task_id,
                response_text,
            },
            JobOutcome::Failed { task_id, error } => Self::Failed {
                task_id: Some(task_id),
                error,
            },
            JobOutcome::Cancelled { task_id } => Self::Cancelled { task_id },
            JobOutcome::Forbidden { task_id } => Self::Forbidden {
                task_id: task_id.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_deserializes_camel_case() {
        let req: TaskStartRequest = serde_json::from_str(
            r#"{"kind": "worker", "workerId": "coder", "task": "Do work",
                "attachments": ["a.md"], "autoSpawn": false}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            TaskStartRequest::worker("coder", "Do work")
                .with_attachments(vec!["a.md".into()])
                .with_auto_spawn(false)
        );
    }

    #[test]
    fn rejected_serializes_without_task_id() {
        let json = serde_json::to_value(TaskResponse::rejected("Missing workerId")).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "Missing workerId");
        assert!(json.get("taskId").is_none());
    }

    #[test]
    fn listed_uses_ok_status() {
        let resp = TaskResponse::Listed {
            view: ListView::Tasks,
            format: ListFormat::Json,
            count: 0,
            output: "[]".into(),
        };
        assert_eq!(resp.status(), "ok");
        assert_eq!(serde_json::to_value(&resp).unwrap()["status"], "ok");
    }

    #[test]
    fn forbidden_converts_from_outcome() {
        let id = Uuid::new_v4();
        let resp: TaskResponse = JobOutcome::Forbidden { task_id: id }.into();
        assert_eq!(resp.status(), "forbidden");
        assert_eq!(resp.task_id(), Some(id));
    }
}
