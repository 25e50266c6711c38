//! Wiring: builds the task service and background manager from config.

use std::sync::Arc;

use tracing::info;

use crate::background::{BackgroundManager, SessionApi};
use crate::concurrency::ConcurrencyManager;
use crate::config::OrchestratorConfig;
use crate::error::{ConfigError, Result};
use crate::jobs::JobRegistry;
use crate::protocol::{TaskDispatcher, TaskService, TaskServiceDeps};
use crate::workers::{WorkerPool, WorkerSpawner, load_profiles};

/// Externally supplied collaborators.
pub struct Collaborators {
    pub dispatcher: Option<Arc<dyn TaskDispatcher>>,
    pub spawner: Option<Arc<dyn WorkerSpawner>>,
    pub sessions: Arc<dyn SessionApi>,
}

/// The assembled core: one registry, pool, and background manager sharing
/// a concurrency manager.
pub struct Orchestrator {
    concurrency: Arc<ConcurrencyManager>,
    tasks: TaskService,
    background: Arc<BackgroundManager>,
}

impl Orchestrator {
    pub async fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Self> {
        let root = &config.protocol.attachment_root;
        let is_dir = tokio::fs::metadata(root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_TASKS_ATTACHMENT_ROOT".to_string(),
                message: format!("{} is not a directory", root.display()),
            }
            .into());
        }

        let profiles = match &config.workers.profiles_path {
            Some(path) => load_profiles(path).await?,
            None => Vec::new(),
        };
        let pool = Arc::new(WorkerPool::new(
            config.workers.clone(),
            collaborators.spawner,
        ));
        let profile_count = profiles.len();
        for profile in profiles {
            pool.register_profile(profile).await;
        }

        let concurrency = Arc::new(ConcurrencyManager::new(config.gated_concurrency()));
        let tasks = TaskService::new(TaskServiceDeps {
            registry: Arc::new(JobRegistry::new()),
            pool,
            dispatcher: collaborators.dispatcher,
            protocol: config.protocol.clone(),
            jobs: config.jobs.clone(),
        });
        let background = BackgroundManager::with_concurrency(
            config.background.clone(),
            collaborators.sessions,
            Arc::clone(&concurrency),
        );

        info!(
            workers = profile_count,
            attachment_root = %root.display(),
            "Orchestrator ready"
        );
        Ok(Self {
            concurrency,
            tasks,
            background,
        })
    }

    /// Build from `AGENT_TASKS_*` environment variables.
    pub async fn from_env(collaborators: Collaborators) -> Result<Self> {
        Self::new(OrchestratorConfig::from_env(), collaborators).await
    }

    pub fn tasks(&self) -> &TaskService {
        &self.tasks
    }

    pub fn background(&self) -> &Arc<BackgroundManager> {
        &self.background
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyManager> {
        &self.concurrency
    }

    /// Stop background polling, cancel outstanding jobs, stop every worker.
    pub async fn shutdown(&self) {
        self.background.cleanup();
        self.tasks.shutdown().await;
        info!("Orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::background::{
        CreateSessionRequest, PromptRequest, SessionInfo, SessionMessage, SessionStatus,
        SessionTodo,
    };
    use crate::config::{ProtocolConfig, WorkerPoolConfig};
    use crate::error::Error;

    /// Never has any data.
    struct SilentSessions;

    #[async_trait]
    impl SessionApi for SilentSessions {
        async fn create(&self, _: CreateSessionRequest) -> anyhow::Result<Option<SessionInfo>> {
            Ok(None)
        }
        async fn prompt(&self, _: &str, _: PromptRequest) -> anyhow::Result<()> {
            Ok(())
        }
        async fn messages(&self, _: &str) -> anyhow::Result<Option<Vec<SessionMessage>>> {
            Ok(None)
        }
        async fn status(&self, _: &str) -> anyhow::Result<Option<SessionStatus>> {
            Ok(None)
        }
        async fn todo(&self, _: &str) -> anyhow::Result<Option<Vec<SessionTodo>>> {
            Ok(None)
        }
    }

    fn collaborators() -> Collaborators {
        Collaborators {
            dispatcher: None,
            spawner: None,
            sessions: Arc::new(SilentSessions),
        }
    }

    fn config(root: &TempDir) -> OrchestratorConfig {
        OrchestratorConfig {
            protocol: ProtocolConfig {
                attachment_root: root.path().to_path_buf(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn loads_profiles_and_gates_background_sessions() {
        let root = TempDir::new().unwrap();
        let profiles = root.path().join("workers.json");
        std::fs::write(&profiles, r#"[{"id": "coder", "model": "m"}]"#).unwrap();

        let mut config = config(&root);
        config.workers = WorkerPoolConfig {
            profiles_path: Some(profiles),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(config, collaborators()).await.unwrap();

        assert!(orchestrator.tasks().pool().profile("coder").await.is_some());
        assert_eq!(orchestrator.concurrency().limit("background-session"), 5);
        orchestrator.shutdown().await;
        assert!(orchestrator.background().is_shut_down());
    }

    #[tokio::test]
    async fn bad_profiles_file_is_a_config_error() {
        let root = TempDir::new().unwrap();
        let profiles = root.path().join("workers.json");
        std::fs::write(&profiles, "{").unwrap();

        let mut config = config(&root);
        config.workers.profiles_path = Some(profiles);
        let err = Orchestrator::new(config, collaborators())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn missing_attachment_root_is_rejected() {
        let root = TempDir::new().unwrap();
        let config = OrchestratorConfig {
            protocol: ProtocolConfig {
                attachment_root: root.path().join("nope"),
            },
            ..Default::default()
        };
        let err = Orchestrator::new(config, collaborators())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("is not a directory"));
    }
}
