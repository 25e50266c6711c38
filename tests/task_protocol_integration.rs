//! Integration tests for the task protocol and background poller.
//!
//! Each test builds isolated registry, pool, and manager instances with stub
//! collaborators and drives them through the public API only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::time::timeout;

use agent_tasks::background::{
    BackgroundManager, BackgroundStatus, CreateSessionRequest, LaunchInput,
    NotificationSink, PromptRequest, SessionApi, SessionInfo, SessionMessage, SessionStatus,
    SessionTodo, TaskNotification, TodoStatus,
};
use agent_tasks::concurrency::ConcurrencyManager;
use agent_tasks::config::{
    BackgroundConfig, ConcurrencyConfig, JobConfig, ProtocolConfig, WorkerPoolConfig,
};
use agent_tasks::error::ConcurrencyError;
use agent_tasks::jobs::JobRegistry;
use agent_tasks::protocol::{
    DispatchInput, DispatchOutput, TaskDispatcher, TaskResponse, TaskService, TaskServiceDeps,
    TaskStartRequest,
};
use agent_tasks::workers::{
    SpawnOptions, WorkerInstance, WorkerPool, WorkerProfile, WorkerSpawner, WorkerStatus,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers `done:<task>`; tasks starting with `slow` take a while.
struct StubDispatcher;

#[async_trait]
impl TaskDispatcher for StubDispatcher {
    async fn dispatch(&self, input: DispatchInput) -> anyhow::Result<DispatchOutput> {
        if input.task.starts_with("slow") {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(DispatchOutput {
            response_text: format!("done:{}", input.task),
        })
    }
}

#[derive(Default)]
struct StubSpawner {
    spawns: AtomicUsize,
}

#[async_trait]
impl WorkerSpawner for StubSpawner {
    async fn spawn(
        &self,
        profile: &WorkerProfile,
        options: SpawnOptions,
    ) -> anyhow::Result<WorkerInstance> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(WorkerInstance::new(
            profile.clone(),
            WorkerStatus::Ready,
            options.port,
        ))
    }
}

struct Harness {
    service: Arc<TaskService>,
    spawner: Arc<StubSpawner>,
    _root: TempDir,
}

async fn harness() -> Harness {
    let root = TempDir::new().unwrap();
    let spawner = Arc::new(StubSpawner::default());
    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig::default(),
        Some(spawner.clone()),
    ));
    pool.register_profile(WorkerProfile::new("coder", "test-model"))
        .await;

    let service = TaskService::new(TaskServiceDeps {
        registry: Arc::new(JobRegistry::new()),
        pool,
        dispatcher: Some(Arc::new(StubDispatcher)),
        protocol: ProtocolConfig {
            attachment_root: root.path().to_path_buf(),
        },
        jobs: JobConfig::default(),
    });
    Harness {
        service: Arc::new(service),
        spawner,
        _root: root,
    }
}

fn task_id(resp: &TaskResponse) -> String {
    resp.task_id()
        .unwrap_or_else(|| panic!("no task id in {resp:?}"))
        .to_string()
}

#[tokio::test]
async fn worker_task_start_then_await_succeeds() {
    let h = harness().await;
    let started = h
        .service
        .start("session-a", TaskStartRequest::worker("coder", "Do work"))
        .await;
    assert_eq!(started.status(), "running");

    let done = timeout(
        TEST_TIMEOUT,
        h.service.await_task("session-a", &task_id(&started), None),
    )
    .await
    .expect("await hung");

    let json: Value = serde_json::to_value(&done).unwrap();
    assert_eq!(json["status"], "succeeded");
    assert_eq!(json["responseText"], "done:Do work");
}

#[tokio::test]
async fn other_session_is_forbidden_everywhere() {
    let h = harness().await;
    let started = h
        .service
        .start("session-a", TaskStartRequest::inline("slow private work"))
        .await;
    let id = task_id(&started);

    assert_eq!(h.service.peek("session-b", &id).await.status(), "forbidden");
    assert_eq!(
        h.service
            .await_task("session-b", &id, Some(Duration::from_millis(10)))
            .await
            .status(),
        "forbidden"
    );
    assert_eq!(h.service.cancel("session-b", &id).await.status(), "forbidden");

    let json = serde_json::to_value(h.service.peek("session-b", &id).await).unwrap();
    assert!(json.get("responseText").is_none());
    assert!(json.get("error").is_none());

    // The owner is unaffected.
    assert_eq!(h.service.peek("session-a", &id).await.status(), "running");
}

#[tokio::test]
async fn missing_worker_id_and_bad_attachment_are_rejected() {
    let h = harness().await;

    let missing: TaskStartRequest =
        serde_json::from_str(r#"{"kind": "worker", "task": "Do work", "autoSpawn": true}"#)
            .unwrap();
    let resp = h.service.start("s", missing).await;
    assert!(resp.error().unwrap().contains("Missing workerId"));

    let escape = TaskStartRequest::worker("coder", "Do work")
        .with_attachments(vec!["../secret.txt".to_string()]);
    let resp = h.service.start("s", escape).await;
    assert!(resp.error().unwrap().contains("Invalid attachment path"));
    assert_eq!(h.spawner.spawns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn zero_timeout_await_leaves_job_running() {
    let h = harness().await;
    let started = h
        .service
        .start("s", TaskStartRequest::inline("slow job"))
        .await;
    let id = task_id(&started);

    let waited = h
        .service
        .await_task("s", &id, Some(Duration::ZERO))
        .await;
    assert_eq!(waited.status(), "failed");
    assert!(waited.error().unwrap().contains("Timed out waiting"));
    assert_eq!(h.service.peek("s", &id).await.status(), "running");

    // A later await still sees the real completion.
    let done = timeout(TEST_TIMEOUT, h.service.await_task("s", &id, None))
        .await
        .expect("await hung");
    assert_eq!(done.status(), "succeeded");
}

#[tokio::test]
async fn concurrent_worker_starts_spawn_once() {
    let h = harness().await;
    let (a, b) = tokio::join!(
        h.service.start("s", TaskStartRequest::worker("coder", "one")),
        h.service.start("s", TaskStartRequest::worker("coder", "two")),
    );
    assert_eq!(a.status(), "running");
    assert_eq!(b.status(), "running");
    assert_eq!(h.spawner.spawns.load(Ordering::SeqCst), 1);

    h.service.shutdown().await;
    assert!(h.service.pool().instances().await.is_empty());
}

#[tokio::test]
async fn concurrency_timeout_leaves_no_partial_hold() {
    let manager = Arc::new(ConcurrencyManager::new(ConcurrencyConfig::default()));
    manager.acquire("k", None).await.unwrap();

    let err = manager
        .acquire("k", Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, ConcurrencyError::Timeout { .. }));
    assert!(err.to_string().contains("timed out waiting for concurrency slot"));

    manager.release("k");
    timeout(TEST_TIMEOUT, manager.acquire("k", Some(Duration::from_millis(20))))
        .await
        .expect("acquire hung")
        .unwrap();
    assert_eq!(manager.active_count("k"), 1);
}

/// Session backend whose todo answers follow a script; the last one repeats.
struct ScriptedSessions {
    todos: Mutex<VecDeque<Option<Vec<SessionTodo>>>>,
}

impl ScriptedSessions {
    fn new(script: Vec<Option<Vec<SessionTodo>>>) -> Self {
        Self {
            todos: Mutex::new(script.into()),
        }
    }
}

#[async_trait]
impl SessionApi for ScriptedSessions {
    async fn create(&self, request: CreateSessionRequest) -> anyhow::Result<Option<SessionInfo>> {
        Ok(Some(SessionInfo {
            id: format!("child-of-{}", request.parent_session_id),
        }))
    }

    async fn prompt(&self, _session_id: &str, _request: PromptRequest) -> anyhow::Result<()> {
        Ok(())
    }

    async fn messages(&self, _session_id: &str) -> anyhow::Result<Option<Vec<SessionMessage>>> {
        Ok(None)
    }

    async fn status(&self, _session_id: &str) -> anyhow::Result<Option<SessionStatus>> {
        Ok(Some(SessionStatus::Idle))
    }

    async fn todo(&self, _session_id: &str) -> anyhow::Result<Option<Vec<SessionTodo>>> {
        let mut script = self.todos.lock().unwrap();
        Ok(if script.len() > 1 {
            script.pop_front().flatten()
        } else {
            script.front().cloned().flatten()
        })
    }
}

#[derive(Default)]
struct CountingSink {
    count: AtomicUsize,
}

#[async_trait]
impl NotificationSink for CountingSink {
    async fn notify(&self, _notification: &TaskNotification) -> anyhow::Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn background_config() -> BackgroundConfig {
    BackgroundConfig {
        poll_interval: Duration::from_secs(3600),
        ..BackgroundConfig::default()
    }
}

fn launch_input() -> LaunchInput {
    LaunchInput {
        parent_session_id: "parent".into(),
        description: "audit".into(),
        prompt: "audit the repo".into(),
        agent: "general".into(),
    }
}

#[tokio::test]
async fn background_task_with_no_todo_data_stays_running() {
    let manager = BackgroundManager::new(
        background_config(),
        Arc::new(ScriptedSessions::new(vec![None])),
    );
    let task = manager.launch(launch_input()).await.unwrap();

    manager.poll_once().await;
    assert_eq!(
        manager.get(task.id).unwrap().status,
        BackgroundStatus::Running
    );
    manager.cleanup();
}

#[tokio::test]
async fn background_pending_then_completed_notifies_once() {
    let manager = BackgroundManager::new(
        background_config(),
        Arc::new(ScriptedSessions::new(vec![
            Some(vec![SessionTodo::new("a", TodoStatus::Pending)]),
            Some(vec![SessionTodo::new("a", TodoStatus::Completed)]),
        ])),
    );
    let sink = Arc::new(CountingSink::default());
    manager.add_sink(sink.clone()).await;
    let task = manager.launch(launch_input()).await.unwrap();

    for _ in 0..4 {
        manager.poll_once().await;
    }
    assert_eq!(sink.count.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.get(task.id).unwrap().status,
        BackgroundStatus::Completed
    );
}
