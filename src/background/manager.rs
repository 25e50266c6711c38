//! Background task manager: launches work into external sessions and
//! reconciles it against the session API until it finishes.
//!
//! Two triggers feed the same `reevaluate` path: a periodic poll tick and
//! routed session events. Concurrent triggers for one task coalesce; the
//! second caller returns without querying. Session creation is gated by the
//! concurrency manager, and the slot is held until the task turns terminal.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::background::notify::{NotificationSink, TaskNotification};
use crate::background::session::{
    CreateSessionRequest, PromptRequest, SessionApi, SessionStatus, last_assistant_text,
};
use crate::background::task::{BackgroundStatus, BackgroundTask, LaunchInput};
use crate::concurrency::{ConcurrencyManager, SlotPermit};
use crate::config::{BackgroundConfig, ConcurrencyConfig};
use crate::error::{BackgroundError, SessionError};

/// Broadcast channel capacity for notification observers.
const NOTIFICATION_CAPACITY: usize = 256;

/// Lifecycle events routed from the session backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session stopped generating; re-check its task now.
    Idle { session_id: String },
    Error { session_id: String, error: String },
    Deleted { session_id: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Idle { session_id }
            | Self::Error { session_id, .. }
            | Self::Deleted { session_id } => session_id,
        }
    }
}

/// Terminal state chosen by an evaluation or event.
struct Terminal {
    status: BackgroundStatus,
    error: Option<String>,
    response_text: Option<String>,
}

impl Terminal {
    fn completed(response_text: Option<String>) -> Self {
        Self {
            status: BackgroundStatus::Completed,
            error: None,
            response_text,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: BackgroundStatus::Failed,
            error: Some(error.into()),
            response_text: None,
        }
    }

    fn timeout(limit: Duration) -> Self {
        Self {
            status: BackgroundStatus::Timeout,
            error: Some(format!(
                "Task exceeded timeout of {}ms",
                limit.as_millis()
            )),
            response_text: None,
        }
    }
}

struct TrackedTask {
    task: BackgroundTask,
    /// Session slot, released when the task leaves the running set.
    permit: SlotPermit,
}

#[derive(Default)]
struct ManagerState {
    running: HashMap<Uuid, TrackedTask>,
    /// Finished tasks, oldest first.
    history: VecDeque<BackgroundTask>,
    /// Tasks with an evaluation in flight.
    evaluating: HashSet<Uuid>,
}

/// Tracks background tasks from launch to their single terminal notification.
pub struct BackgroundManager {
    config: BackgroundConfig,
    concurrency: Arc<ConcurrencyManager>,
    sessions: Arc<dyn SessionApi>,
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
    notifications: broadcast::Sender<TaskNotification>,
    state: Mutex<ManagerState>,
    poller: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl BackgroundManager {
    /// Create a manager with its own session gate sized by
    /// `config.default_concurrency`.
    pub fn new(config: BackgroundConfig, sessions: Arc<dyn SessionApi>) -> Arc<Self> {
        let gate = ConcurrencyConfig::default()
            .with_limit(config.concurrency_key.clone(), config.default_concurrency);
        Self::with_concurrency(config, sessions, Arc::new(ConcurrencyManager::new(gate)))
    }

    /// Create a manager that gates session creation on a shared concurrency
    /// manager under `config.concurrency_key`.
    pub fn with_concurrency(
        config: BackgroundConfig,
        sessions: Arc<dyn SessionApi>,
        concurrency: Arc<ConcurrencyManager>,
    ) -> Arc<Self> {
        let (notifications, _rx) = broadcast::channel(NOTIFICATION_CAPACITY);
        Arc::new(Self {
            config,
            concurrency,
            sessions,
            sinks: RwLock::new(Vec::new()),
            notifications,
            state: Mutex::new(ManagerState::default()),
            poller: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poller(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub async fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Subscribe to terminal-transition notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.notifications.subscribe()
    }

    /// Create a session for `input`, prompt it, and start tracking it.
    ///
    /// Waits for a session slot first. A prompt that the backend rejects
    /// still yields a task, already `failed`, with its slot released.
    pub async fn launch(
        self: &Arc<Self>,
        input: LaunchInput,
    ) -> Result<BackgroundTask, BackgroundError> {
        if self.is_shut_down() {
            return Err(BackgroundError::ShutDown);
        }
        let created_at = Utc::now();
        let permit = self
            .concurrency
            .permit(&self.config.concurrency_key, self.config.acquire_timeout)
            .await?;

        let session = self
            .sessions
            .create(CreateSessionRequest {
                parent_session_id: input.parent_session_id.clone(),
                title: input.description.clone(),
            })
            .await
            .map_err(|e| SessionError::RequestFailed {
                operation: "create".to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| SessionError::NoData {
                operation: "create".to_string(),
            })?;

        let task = BackgroundTask::new(input, session.id, created_at);
        {
            let mut state = self.state();
            if self.is_shut_down() {
                return Err(BackgroundError::ShutDown);
            }
            state.running.insert(
                task.id,
                TrackedTask {
                    task: task.clone(),
                    permit,
                },
            );
        }
        info!(
            task_id = %task.id,
            session_id = %task.session_id,
            parent_session_id = %task.parent_session_id,
            agent = %task.agent,
            "Background task launched"
        );

        let prompt = PromptRequest {
            agent: task.agent.clone(),
            text: task.prompt.clone(),
        };
        if let Err(e) = self.sessions.prompt(&task.session_id, prompt).await {
            warn!(task_id = %task.id, error = %e, "Failed to prompt background session");
            let failed = self
                .finish(task.id, Terminal::failed(format!("Failed to prompt session: {e}")))
                .await;
            return Ok(failed.unwrap_or(task));
        }

        self.ensure_poller();
        Ok(task)
    }

    fn ensure_poller(self: &Arc<Self>) {
        let mut poller = self.poller();
        if self.is_shut_down() || poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *poller = Some(spawn_poller(Arc::downgrade(self), self.config.poll_interval));
    }

    /// Re-evaluate every running task once.
    ///
    /// Overdue tasks are timed out before any evaluation is claimed, so a
    /// task stuck in a slow query still reaches `timeout`.
    pub async fn poll_once(&self) {
        let now = Utc::now();
        let (overdue, due): (Vec<Uuid>, Vec<Uuid>) = {
            let state = self.state();
            let (overdue, due): (Vec<&TrackedTask>, Vec<&TrackedTask>) = state
                .running
                .values()
                .partition(|t| t.task.elapsed(now) > self.config.task_timeout);
            (
                overdue.iter().map(|t| t.task.id).collect(),
                due.iter().map(|t| t.task.id).collect(),
            )
        };
        if overdue.is_empty() && due.is_empty() {
            return;
        }
        debug!(
            overdue = overdue.len(),
            due = due.len(),
            "Polling background tasks"
        );
        for id in overdue {
            self.finish(id, Terminal::timeout(self.config.task_timeout))
                .await;
        }
        join_all(due.into_iter().map(|id| self.reevaluate(id))).await;
    }

    /// Check one task against the session API and finish it if it is done or
    /// has run past its timeout. No-op when another evaluation is in flight.
    pub async fn reevaluate(&self, task_id: Uuid) {
        let Some(task) = self.claim(task_id) else {
            return;
        };
        let _claim = EvaluationClaim {
            manager: self,
            task_id,
        };
        if let Some(terminal) = self.evaluate(&task).await {
            self.finish(task_id, terminal).await;
        }
    }

    fn claim(&self, task_id: Uuid) -> Option<BackgroundTask> {
        let mut state = self.state();
        let task = state.running.get(&task_id)?.task.clone();
        if !state.evaluating.insert(task_id) {
            debug!(task_id = %task_id, "Evaluation already in flight");
            return None;
        }
        Some(task)
    }

    async fn evaluate(&self, task: &BackgroundTask) -> Option<Terminal> {
        if task.elapsed(Utc::now()) > self.config.task_timeout {
            return Some(Terminal::timeout(self.config.task_timeout));
        }

        let Some(todos) = self
            .query(task.id, "todo", self.sessions.todo(&task.session_id))
            .await
        else {
            debug!(task_id = %task.id, "No todo data yet");
            return None;
        };

        // An empty list only counts once a finished list has been seen.
        let all_finished = !todos.is_empty() && todos.iter().all(|t| t.status.is_finished());
        if all_finished {
            self.mark_saw_completed(task.id);
        } else if !(todos.is_empty() && task.saw_completed_todos) {
            return None;
        }

        let status = self
            .query(task.id, "status", self.sessions.status(&task.session_id))
            .await;
        if status == Some(SessionStatus::Busy) {
            debug!(task_id = %task.id, "Session still busy, deferring completion");
            return None;
        }

        let response_text = self
            .query(task.id, "messages", self.sessions.messages(&task.session_id))
            .await
            .and_then(|messages| last_assistant_text(&messages));
        Some(Terminal::completed(response_text))
    }

    /// Run one session query bounded by `query_timeout`. Errors and timeouts
    /// are indeterminate and read as no data.
    async fn query<T>(
        &self,
        task_id: Uuid,
        operation: &'static str,
        call: impl Future<Output = anyhow::Result<Option<T>>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.config.query_timeout, call).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!(task_id = %task_id, operation, error = %e, "Session query failed");
                None
            }
            Err(_) => {
                warn!(
                    task_id = %task_id,
                    operation,
                    timeout_ms = self.config.query_timeout.as_millis() as u64,
                    "Session query timed out"
                );
                None
            }
        }
    }

    fn mark_saw_completed(&self, task_id: Uuid) {
        if let Some(tracked) = self.state().running.get_mut(&task_id) {
            tracked.task.saw_completed_todos = true;
        }
    }

    /// Apply a terminal transition, release the slot, and notify once.
    async fn finish(&self, task_id: Uuid, terminal: Terminal) -> Option<BackgroundTask> {
        let (task, permit) = {
            let mut state = self.state();
            let mut tracked = state.running.remove(&task_id)?;
            if !tracked
                .task
                .finish(terminal.status, terminal.error, terminal.response_text)
            {
                return None;
            }
            state.history.push_back(tracked.task.clone());
            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
            }
            (tracked.task, tracked.permit)
        };
        drop(permit);

        info!(
            task_id = %task.id,
            status = %task.status,
            error = task.error.as_deref().unwrap_or(""),
            "Background task finished"
        );
        self.notify(&task).await;
        Some(task)
    }

    async fn notify(&self, task: &BackgroundTask) {
        let notification = TaskNotification::from_task(task);
        let sinks = self.sinks.read().await.clone();
        for sink in sinks {
            if let Err(e) = sink.notify(&notification).await {
                warn!(task_id = %task.id, error = %e, "Notification sink failed");
            }
        }
        // Ok if nobody is subscribed.
        let _ = self.notifications.send(notification);
    }

    /// Route a session lifecycle event to the task bound to that session.
    pub async fn handle_event(&self, event: SessionEvent) {
        let task_id = self
            .state()
            .running
            .values()
            .find(|t| t.task.session_id == event.session_id())
            .map(|t| t.task.id);
        let Some(task_id) = task_id else {
            debug!(session_id = %event.session_id(), "Event for untracked session");
            return;
        };

        match event {
            SessionEvent::Idle { .. } => self.reevaluate(task_id).await,
            SessionEvent::Error { error, .. } => {
                self.finish(task_id, Terminal::failed(error)).await;
            }
            SessionEvent::Deleted { .. } => {
                self.finish(task_id, Terminal::failed("Session was deleted"))
                    .await;
            }
        }
    }

    /// A running or recently finished task.
    pub fn get(&self, task_id: Uuid) -> Option<BackgroundTask> {
        let state = self.state();
        state
            .running
            .get(&task_id)
            .map(|t| t.task.clone())
            .or_else(|| state.history.iter().find(|t| t.id == task_id).cloned())
    }

    /// Tasks owned by `parent_session_id`, oldest first.
    pub fn list(&self, parent_session_id: &str) -> Vec<BackgroundTask> {
        let state = self.state();
        let mut tasks: Vec<BackgroundTask> = state
            .running
            .values()
            .map(|t| &t.task)
            .chain(state.history.iter())
            .filter(|t| t.parent_session_id == parent_session_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn running_count(&self) -> usize {
        self.state().running.len()
    }

    /// Fail a running task on behalf of its owner.
    pub async fn cancel(
        &self,
        task_id: Uuid,
        parent_session_id: &str,
    ) -> Result<BackgroundTask, BackgroundError> {
        let Some(task) = self.get(task_id) else {
            return Err(BackgroundError::NotFound { id: task_id });
        };
        if task.parent_session_id != parent_session_id {
            return Err(BackgroundError::Forbidden {
                id: task_id,
                session_id: parent_session_id.to_string(),
            });
        }
        if task.status.is_terminal() {
            return Err(BackgroundError::AlreadyTerminal {
                id: task_id,
                status: task.status.to_string(),
            });
        }
        match self.finish(task_id, Terminal::failed("Cancelled")).await {
            Some(task) => Ok(task),
            // Finished by another trigger in the meantime.
            None => Err(BackgroundError::AlreadyTerminal {
                id: task_id,
                status: self
                    .get(task_id)
                    .map(|t| t.status.to_string())
                    .unwrap_or_default(),
            }),
        }
    }

    /// Stop polling and release every held session slot. Idempotent.
    pub fn cleanup(&self) {
        let first = !self.shut_down.swap(true, Ordering::SeqCst);
        if let Some(handle) = self.poller().take() {
            handle.abort();
        }
        let released: Vec<TrackedTask> = {
            let mut state = self.state();
            state.evaluating.clear();
            state.running.drain().map(|(_, tracked)| tracked).collect()
        };
        if first || !released.is_empty() {
            info!(released = released.len(), "Background manager cleaned up");
        }
    }
}

impl Drop for BackgroundManager {
    fn drop(&mut self) {
        if let Some(handle) = self.poller().take() {
            handle.abort();
        }
    }
}

/// Marks a task's evaluation as finished when dropped.
struct EvaluationClaim<'a> {
    manager: &'a BackgroundManager,
    task_id: Uuid,
}

impl Drop for EvaluationClaim<'_> {
    fn drop(&mut self) {
        self.manager.state().evaluating.remove(&self.task_id);
    }
}

/// Spawn the poll loop. It exits once the manager is dropped or shut down.
fn spawn_poller(manager: Weak<BackgroundManager>, period: Duration) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        debug!(interval_ms = period.as_millis() as u64, "Background poller started");
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if manager.is_shut_down() {
                return;
            }
            manager.poll_once().await;
        }
    })
}
