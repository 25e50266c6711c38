//! In-memory job registry with session-scoped access and fan-out waiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::jobs::state::{Job, JobStatus, NewJob};

/// Classified view of a job as seen by one requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    #[serde(rename_all = "camelCase")]
    Pending { task_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Running { task_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Succeeded { task_id: Uuid, response_text: String },
    #[serde(rename_all = "camelCase")]
    Failed { task_id: Uuid, error: String },
    #[serde(rename_all = "camelCase")]
    Cancelled { task_id: Uuid },
    /// Unknown job or wrong session. Carries nothing beyond the id asked for.
    #[serde(rename_all = "camelCase")]
    Forbidden { task_id: Uuid },
}

impl JobOutcome {
    pub fn from_job(job: &Job) -> Self {
        let task_id = job.id;
        match job.status {
            JobStatus::Pending => Self::Pending { task_id },
            JobStatus::Running => Self::Running { task_id },
            JobStatus::Succeeded => Self::Succeeded {
                task_id,
                response_text: job.result.clone().unwrap_or_default(),
            },
            JobStatus::Failed => Self::Failed {
                task_id,
                error: job.error.clone().unwrap_or_default(),
            },
            JobStatus::Cancelled => Self::Cancelled { task_id },
        }
    }

    fn timed_out(task_id: Uuid, waited: Duration) -> Self {
        Self::Failed {
            task_id,
            error: format!(
                "Timed out waiting for task {task_id} after {}ms",
                waited.as_millis()
            ),
        }
    }
}

struct Waiter {
    id: u64,
    notify: oneshot::Sender<Job>,
}

struct JobEntry {
    job: Job,
    /// Fired in registration order.
    waiters: Vec<Waiter>,
}

impl JobEntry {
    fn fire_waiters(&mut self) {
        let count = self.waiters.len();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.notify.send(self.job.clone());
        }
        if count > 0 {
            debug!(task_id = %self.job.id, count, "Fired job waiters");
        }
    }
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<Uuid, JobEntry>,
    /// Insertion order, for `list`.
    order: Vec<Uuid>,
}

/// Owns every dispatched job and the waiters registered against them.
#[derive(Default)]
pub struct JobRegistry {
    state: RwLock<RegistryState>,
    next_waiter: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a running job owned by `input.session_id`.
    pub async fn create(&self, input: NewJob) -> Job {
        let job = Job::new(input);
        let mut state = self.state.write().await;
        state.order.push(job.id);
        state.jobs.insert(
            job.id,
            JobEntry {
                job: job.clone(),
                waiters: Vec::new(),
            },
        );
        info!(
            task_id = %job.id,
            session_id = %job.session_id,
            worker_id = job.worker_id.as_deref().unwrap_or("inline"),
            "Job created"
        );
        job
    }

    /// Unscoped lookup, for the orchestration core only.
    pub async fn get(&self, id: Uuid) -> Option<Job> {
        self.state.read().await.jobs.get(&id).map(|e| e.job.clone())
    }

    /// Non-blocking snapshot.
    pub async fn peek(&self, id: Uuid, requester: &str) -> JobOutcome {
        let state = self.state.read().await;
        match state.jobs.get(&id) {
            Some(entry) if entry.job.session_id == requester => JobOutcome::from_job(&entry.job),
            _ => JobOutcome::Forbidden { task_id: id },
        }
    }

    /// Wait for a job to reach a terminal state.
    ///
    /// On timeout the caller gets a `Failed` "Timed out waiting" outcome while
    /// the job itself keeps running. `Some(Duration::ZERO)` never registers a
    /// waiter; `None` waits until the job finishes.
    pub async fn await_job(
        &self,
        id: Uuid,
        requester: &str,
        timeout: Option<Duration>,
    ) -> JobOutcome {
        let (waiter_id, rx) = {
            let mut state = self.state.write().await;
            let entry = match state.jobs.get_mut(&id) {
                Some(entry) if entry.job.session_id == requester => entry,
                _ => return JobOutcome::Forbidden { task_id: id },
            };
            if entry.job.status.is_terminal() {
                return JobOutcome::from_job(&entry.job);
            }
            if timeout == Some(Duration::ZERO) {
                return JobOutcome::timed_out(id, Duration::ZERO);
            }

            // Waiters whose await was dropped have closed receivers.
            entry.waiters.retain(|w| !w.notify.is_closed());
            let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(Waiter {
                id: waiter_id,
                notify: tx,
            });
            debug!(task_id = %id, waiter = waiter_id, "Registered job waiter");
            (waiter_id, rx)
        };

        let received = match timeout {
            None => Ok(rx.await),
            Some(limit) => tokio::time::timeout(limit, rx).await,
        };

        match received {
            Ok(Ok(job)) => JobOutcome::from_job(&job),
            Ok(Err(_)) => JobOutcome::Failed {
                task_id: id,
                error: "Task registry was disposed before the task finished".to_string(),
            },
            Err(_) => {
                let waited = timeout.unwrap_or_default();
                let mut state = self.state.write().await;
                let Some(entry) = state.jobs.get_mut(&id) else {
                    return JobOutcome::timed_out(id, waited);
                };
                entry.waiters.retain(|w| w.id != waiter_id);
                // The job may have finished between the deadline and the lock.
                if entry.job.status.is_terminal() {
                    return JobOutcome::from_job(&entry.job);
                }
                debug!(task_id = %id, waiter = waiter_id, "Job waiter timed out");
                JobOutcome::timed_out(id, waited)
            }
        }
    }

    /// Cancel a non-terminal job and wake its waiters. Terminal jobs are left
    /// untouched and their existing outcome is returned.
    pub async fn cancel(&self, id: Uuid, requester: &str) -> JobOutcome {
        let mut state = self.state.write().await;
        let entry = match state.jobs.get_mut(&id) {
            Some(entry) if entry.job.session_id == requester => entry,
            _ => return JobOutcome::Forbidden { task_id: id },
        };
        if entry.job.cancel() {
            info!(task_id = %id, "Job cancelled");
            entry.fire_waiters();
        }
        JobOutcome::from_job(&entry.job)
    }

    /// Jobs owned by `requester`, in creation order.
    pub async fn list(&self, requester: &str) -> Vec<Job> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|e| e.job.session_id == requester)
            .map(|e| e.job.clone())
            .collect()
    }

    /// Record the dispatcher's outcome and wake every waiter once.
    ///
    /// Returns `false` when the job is unknown or already terminal; a late
    /// result for a cancelled job is dropped.
    pub async fn finish(&self, id: Uuid, outcome: Result<String, String>) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.jobs.get_mut(&id) else {
            debug!(task_id = %id, "Ignoring result for unknown job");
            return false;
        };
        if !entry.job.finish(outcome) {
            debug!(task_id = %id, status = %entry.job.status, "Ignoring late result for finished job");
            return false;
        }
        info!(task_id = %id, status = %entry.job.status, "Job finished");
        entry.fire_waiters();
        true
    }

    /// Cancel everything still running and empty the registry.
    pub async fn dispose_all(&self) {
        let mut state = self.state.write().await;
        let mut cancelled = 0;
        for entry in state.jobs.values_mut() {
            if entry.job.cancel() {
                cancelled += 1;
            }
            entry.fire_waiters();
        }
        state.jobs.clear();
        state.order.clear();
        info!(cancelled, "Job registry disposed");
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.jobs.is_empty()
    }

    #[cfg(test)]
    async fn waiter_count(&self, id: Uuid) -> usize {
        self.state
            .read()
            .await
            .jobs
            .get(&id)
            .map_or(0, |e| e.waiters.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn new_job(session: &str, task: &str) -> NewJob {
        NewJob {
            session_id: session.into(),
            task: task.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let registry = JobRegistry::new();
        let job = registry.create(new_job("a", "work")).await;
        assert_eq!(job.status, JobStatus::Running);

        let fetched = registry.get(job.id).await.unwrap();
        assert_eq!(fetched.task, "work");
        assert_eq!(fetched.session_id, "a");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn zero_timeout_await_preserves_running_job() {
        let registry = JobRegistry::new();
        let job = registry.create(new_job("a", "work")).await;

        let outcome = registry
            .await_job(job.id, "a", Some(Duration::ZERO))
            .await;
        match outcome {
            JobOutcome::Failed { error, .. } => assert!(error.contains("Timed out waiting")),
            other => panic!("Expected timeout failure, got {other:?}"),
        }
        assert_eq!(
            registry.peek(job.id, "a").await,
            JobOutcome::Running { task_id: job.id }
        );
    }

    #[tokio::test]
    async fn timed_out_await_leaves_job_completable() {
        let registry = JobRegistry::new();
        let job = registry.create(new_job("a", "work")).await;

        let outcome = registry
            .await_job(job.id, "a", Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(outcome, JobOutcome::Failed { .. }));

        assert!(registry.finish(job.id, Ok("late".into())).await);
        assert_eq!(
            registry.await_job(job.id, "a", Some(Duration::ZERO)).await,
            JobOutcome::Succeeded {
                task_id: job.id,
                response_text: "late".into()
            }
        );
    }

    #[tokio::test]
    async fn all_waiters_fire_on_completion() {
        let registry = Arc::new(JobRegistry::new());
        let job = registry.create(new_job("a", "work")).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .await_job(job.id, "a", Some(Duration::from_secs(5)))
                    .await
            }));
        }
        // Let every waiter register before completing.
        loop {
            let registered = {
                let state = registry.state.read().await;
                state.jobs[&job.id].waiters.len()
            };
            if registered == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(registry.finish(job.id, Ok("done".into())).await);
        for h in handles {
            assert_eq!(
                h.await.unwrap(),
                JobOutcome::Succeeded {
                    task_id: job.id,
                    response_text: "done".into()
                }
            );
        }
    }

    #[tokio::test]
    async fn abandoned_waiters_are_pruned() {
        let registry = JobRegistry::new();
        let job = registry.create(new_job("a", "work")).await;

        for _ in 0..3 {
            let abandoned = tokio::time::timeout(
                Duration::from_millis(5),
                registry.await_job(job.id, "a", None),
            )
            .await;
            assert!(abandoned.is_err());
        }
        assert_eq!(registry.waiter_count(job.id).await, 3);

        let registry = Arc::new(registry);
        let live = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.await_job(job.id, "a", None).await })
        };
        while registry.waiter_count(job.id).await != 1 {
            tokio::task::yield_now().await;
        }

        registry.finish(job.id, Ok("done".into())).await;
        assert!(matches!(
            live.await.unwrap(),
            JobOutcome::Succeeded { .. }
        ));
    }

    #[tokio::test]
    async fn other_session_is_forbidden() {
        let registry = JobRegistry::new();
        let job = registry.create(new_job("a", "secret work")).await;

        let forbidden = JobOutcome::Forbidden { task_id: job.id };
        assert_eq!(registry.peek(job.id, "b").await, forbidden);
        assert_eq!(
            registry.await_job(job.id, "b", Some(Duration::ZERO)).await,
            forbidden
        );
        assert_eq!(registry.cancel(job.id, "b").await, forbidden);
        assert_eq!(
            registry.peek(job.id, "a").await,
            JobOutcome::Running { task_id: job.id }
        );
    }

    #[tokio::test]
    async fn unknown_job_is_forbidden() {
        let registry = JobRegistry::new();
        let id = Uuid::new_v4();
        assert_eq!(
            registry.peek(id, "a").await,
            JobOutcome::Forbidden { task_id: id }
        );
    }

    #[tokio::test]
    async fn cancel_wakes_waiters_and_blocks_late_result() {
        let registry = Arc::new(JobRegistry::new());
        let job = registry.create(new_job("a", "work")).await;

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.await_job(job.id, "a", None).await })
        };
        loop {
            let registered = registry.state.read().await.jobs[&job.id].waiters.len();
            if registered == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let cancelled = JobOutcome::Cancelled { task_id: job.id };
        assert_eq!(registry.cancel(job.id, "a").await, cancelled);
        assert_eq!(waiter.await.unwrap(), cancelled);

        assert!(!registry.finish(job.id, Ok("late".into())).await);
        assert_eq!(registry.peek(job.id, "a").await, cancelled);
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_noop() {
        let registry = JobRegistry::new();
        let job = registry.create(new_job("a", "work")).await;
        registry.finish(job.id, Err("boom".into())).await;

        let outcome = registry.cancel(job.id, "a").await;
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                task_id: job.id,
                error: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn list_filters_by_session_in_order() {
        let registry = JobRegistry::new();
        let first = registry.create(new_job("a", "one")).await;
        registry.create(new_job("b", "other")).await;
        let second = registry.create(new_job("a", "two")).await;

        let listed: Vec<Uuid> = registry.list("a").await.iter().map(|j| j.id).collect();
        assert_eq!(listed, vec![first.id, second.id]);
        assert!(registry.list("c").await.is_empty());
    }

    #[tokio::test]
    async fn dispose_all_cancels_and_clears() {
        let registry = Arc::new(JobRegistry::new());
        let job = registry.create(new_job("a", "work")).await;
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.await_job(job.id, "a", None).await })
        };
        loop {
            if registry.state.read().await.jobs[&job.id].waiters.len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        registry.dispose_all().await;
        assert_eq!(
            waiter.await.unwrap(),
            JobOutcome::Cancelled { task_id: job.id }
        );
        assert!(registry.is_empty().await);
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let id = Uuid::nil();
        let json = serde_json::to_value(JobOutcome::Succeeded {
            task_id: id,
            response_text: "ok".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["responseText"], "ok");
        assert_eq!(json["taskId"], id.to_string());
    }
}
