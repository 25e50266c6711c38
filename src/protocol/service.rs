//! Task protocol: start, await, peek, cancel, and list dispatched tasks.
//!
//! Every operation returns a [`TaskResponse`] instead of an error so callers
//! always get a classified outcome. Work itself is done by an injected
//! [`TaskDispatcher`]; this layer validates, resolves workers, records jobs,
//! and scopes every query to the requesting session.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{JobConfig, ProtocolConfig};
use crate::jobs::{Job, JobRegistry, NewJob};
use crate::protocol::attachments::resolve_attachments;
use crate::protocol::types::{ListFormat, ListView, TaskKind, TaskResponse, TaskStartRequest};
use crate::workers::{EnsureOptions, WorkerInstance, WorkerPool};

/// Everything a dispatcher needs to run one task.
#[derive(Debug, Clone)]
pub struct DispatchInput {
    pub task_id: Uuid,
    pub session_id: String,
    pub task: String,
    pub attachments: Vec<PathBuf>,
    /// The resolved worker, `None` for inline tasks.
    pub worker: Option<WorkerInstance>,
}

/// What a dispatcher hands back on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutput {
    pub response_text: String,
}

/// Performs the actual work behind a task.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, input: DispatchInput) -> anyhow::Result<DispatchOutput>;
}

/// Shared dependencies for the task service.
#[derive(Clone)]
pub struct TaskServiceDeps {
    pub registry: Arc<JobRegistry>,
    pub pool: Arc<WorkerPool>,
    pub dispatcher: Option<Arc<dyn TaskDispatcher>>,
    pub protocol: ProtocolConfig,
    pub jobs: JobConfig,
}

/// Boundary API over the job registry and worker pool.
pub struct TaskService {
    deps: TaskServiceDeps,
}

/// Longest task text shown in a markdown listing.
const LIST_TASK_PREVIEW_CHARS: usize = 60;

impl TaskService {
    pub fn new(deps: TaskServiceDeps) -> Self {
        Self { deps }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.deps.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.deps.pool
    }

    /// Validate, resolve a worker, record a job, and hand it to the
    /// dispatcher. Returns `running` as soon as the job exists.
    pub async fn start(&self, session_id: &str, request: TaskStartRequest) -> TaskResponse {
        let worker_id = request
            .worker_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        if request.kind == TaskKind::Worker && worker_id.is_none() {
            return TaskResponse::rejected("Missing workerId for worker task");
        }
        if request.task.trim().is_empty() {
            return TaskResponse::rejected("Missing task");
        }

        let attachments =
            match resolve_attachments(&self.deps.protocol.attachment_root, &request.attachments) {
                Ok(paths) => paths,
                Err(e) => return TaskResponse::rejected(e.to_string()),
            };

        let worker = match (request.kind, worker_id) {
            (TaskKind::Worker, Some(id)) => {
                if self.deps.pool.profile(id).await.is_none() {
                    return TaskResponse::rejected(format!("Unknown worker: {id}"));
                }
                if self.deps.dispatcher.is_none() {
                    return TaskResponse::rejected("Task dispatch is not configured");
                }
                match self
                    .resolve_worker(id, request.auto_spawn.unwrap_or(true))
                    .await
                {
                    Ok(instance) => Some(instance),
                    Err(response) => return response,
                }
            }
            _ => None,
        };

        let Some(dispatcher) = self.deps.dispatcher.clone() else {
            return TaskResponse::rejected("Task dispatch is not configured");
        };

        let job = self
            .deps
            .registry
            .create(NewJob {
                session_id: session_id.to_string(),
                worker_id: worker.as_ref().map(|w| w.id().to_string()),
                task: request.task.clone(),
                attachments: attachments.clone(),
            })
            .await;

        self.spawn_dispatch(
            dispatcher,
            DispatchInput {
                task_id: job.id,
                session_id: session_id.to_string(),
                task: request.task,
                attachments,
                worker,
            },
        );

        TaskResponse::Running { task_id: job.id }
    }

    async fn resolve_worker(
        &self,
        worker_id: &str,
        auto_spawn: bool,
    ) -> Result<WorkerInstance, TaskResponse> {
        if let Some(instance) = self.deps.pool.get(worker_id).await
            && instance.is_ready()
        {
            return Ok(instance);
        }
        if !auto_spawn {
            return Err(TaskResponse::rejected(format!(
                "Worker {worker_id} is not running"
            )));
        }
        if !self.deps.pool.can_spawn() {
            return Err(TaskResponse::rejected(format!(
                "Auto-spawn not configured for worker {worker_id}"
            )));
        }
        self.deps
            .pool
            .ensure(worker_id, EnsureOptions::default())
            .await
            .map_err(|e| TaskResponse::rejected(e.to_string()))
    }

    /// Run the dispatcher off the caller's path and record its outcome.
    fn spawn_dispatch(&self, dispatcher: Arc<dyn TaskDispatcher>, input: DispatchInput) {
        let registry = Arc::clone(&self.deps.registry);
        let task_id = input.task_id;
        info!(
            task_id = %task_id,
            worker_id = input.worker.as_ref().map(|w| w.id()).unwrap_or("inline"),
            "Dispatching task"
        );

        tokio::spawn(async move {
            // Nested spawn turns a dispatcher panic into a JoinError.
            let run = tokio::spawn(async move { dispatcher.dispatch(input).await });
            let outcome = match run.await {
                Ok(Ok(output)) => Ok(output.response_text),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("Task dispatcher panicked: {e}")),
            };
            if let Err(error) = &outcome {
                warn!(task_id = %task_id, error = %error, "Task dispatch failed");
            }
            registry.finish(task_id, outcome).await;
        });
    }

    /// Wait for a task. `timeout` defaults to the configured await timeout.
    pub async fn await_task(
        &self,
        session_id: &str,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> TaskResponse {
        let Ok(id) = task_id.parse::<Uuid>() else {
            return forbidden(task_id);
        };
        let timeout = timeout.unwrap_or(self.deps.jobs.default_await_timeout);
        self.deps
            .registry
            .await_job(id, session_id, Some(timeout))
            .await
            .into()
    }

    pub async fn peek(&self, session_id: &str, task_id: &str) -> TaskResponse {
        let Ok(id) = task_id.parse::<Uuid>() else {
            return forbidden(task_id);
        };
        self.deps.registry.peek(id, session_id).await.into()
    }

    /// Cooperative cancel: the job turns terminal, the dispatcher is not interrupted.
    pub async fn cancel(&self, session_id: &str, task_id: &str) -> TaskResponse {
        let Ok(id) = task_id.parse::<Uuid>() else {
            return forbidden(task_id);
        };
        self.deps.registry.cancel(id, session_id).await.into()
    }

    pub async fn list(&self, session_id: &str, view: ListView, format: ListFormat) -> TaskResponse {
        let rendered = match view {
            ListView::Tasks => {
                let jobs = self.deps.registry.list(session_id).await;
                let count = jobs.len();
                render(&jobs, format, render_jobs_markdown).map(|output| (count, output))
            }
            ListView::Workers => {
                let workers = self.deps.pool.instances().await;
                let count = workers.len();
                render(&workers, format, render_workers_markdown).map(|output| (count, output))
            }
        };
        match rendered {
            Ok((count, output)) => TaskResponse::Listed {
                view,
                format,
                count,
                output,
            },
            Err(e) => TaskResponse::rejected(format!("Failed to render list: {e}")),
        }
    }

    /// Cancel outstanding jobs and stop every worker.
    pub async fn shutdown(&self) {
        self.deps.registry.dispose_all().await;
        self.deps.pool.stop_all().await;
    }
}

fn forbidden(task_id: &str) -> TaskResponse {
    TaskResponse::Forbidden {
        task_id: task_id.to_string(),
    }
}

fn render<T: serde::Serialize>(
    items: &[T],
    format: ListFormat,
    markdown: fn(&[T]) -> String,
) -> Result<String, serde_json::Error> {
    match format {
        ListFormat::Json => serde_json::to_string_pretty(items),
        ListFormat::Markdown => Ok(markdown(items)),
    }
}

fn preview(text: &str) -> String {
    let single_line = text.replace(['\n', '|'], " ");
    if single_line.chars().count() <= LIST_TASK_PREVIEW_CHARS {
        return single_line;
    }
    let cut: String = single_line.chars().take(LIST_TASK_PREVIEW_CHARS).collect();
    format!("{cut}…")
}

fn render_jobs_markdown(jobs: &[Job]) -> String {
    if jobs.is_empty() {
        return "No tasks.".to_string();
    }
    let mut out = String::from("| Task | Worker | Status | Created | Description |\n");
    out.push_str("|---|---|---|---|---|\n");
    for job in jobs {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} |",
            job.id,
            job.worker_id.as_deref().unwrap_or("inline"),
            job.status,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            preview(&job.task),
        );
    }
    out
}

fn render_workers_markdown(workers: &[WorkerInstance]) -> String {
    if workers.is_empty() {
        return "No workers.".to_string();
    }
    let mut out = String::from("| Worker | Model | Status | Port |\n");
    out.push_str("|---|---|---|---|\n");
    for worker in workers {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} |",
            worker.id(),
            worker.profile.model,
            worker.status,
            worker.port,
        );
    }
    out
}
