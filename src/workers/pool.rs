//! Worker pool: at most one live instance per profile.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::WorkerPoolConfig;
use crate::error::WorkerError;
use crate::workers::profile::{SpawnOptions, WorkerInstance, WorkerProfile, WorkerStatus};

/// Starts and stops worker processes on behalf of the pool.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Launch a worker and return once it is ready.
    async fn spawn(
        &self,
        profile: &WorkerProfile,
        options: SpawnOptions,
    ) -> anyhow::Result<WorkerInstance>;

    /// Tear a worker down. The default does nothing.
    async fn stop(&self, _instance: &WorkerInstance) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Per-call overrides for [`WorkerPool::ensure`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureOptions {
    pub base_port: Option<u16>,
    pub timeout: Option<Duration>,
}

/// Holding a cell's lock is what makes a spawn exclusive for that profile.
type InstanceCell = Arc<Mutex<Option<WorkerInstance>>>;

/// Tracks worker profiles and their running instances.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    profiles: RwLock<HashMap<String, WorkerProfile>>,
    instances: Mutex<HashMap<String, InstanceCell>>,
    /// Port offset handed to the next spawn.
    next_port_offset: AtomicU16,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, spawner: Option<Arc<dyn WorkerSpawner>>) -> Self {
        Self {
            config,
            spawner,
            profiles: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            next_port_offset: AtomicU16::new(0),
        }
    }

    /// Whether this pool can start workers on demand.
    pub fn can_spawn(&self) -> bool {
        self.spawner.is_some()
    }

    pub async fn register_profile(&self, profile: WorkerProfile) {
        info!(worker_id = %profile.id, model = %profile.model, "Registered worker profile");
        self.profiles.write().await.insert(profile.id.clone(), profile);
    }

    pub async fn profile(&self, id: &str) -> Option<WorkerProfile> {
        self.profiles.read().await.get(id).cloned()
    }

    /// All profiles, sorted by id.
    pub async fn profiles(&self) -> Vec<WorkerProfile> {
        let mut profiles: Vec<_> = self.profiles.read().await.values().cloned().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    async fn cell(&self, id: &str) -> InstanceCell {
        Arc::clone(
            self.instances
                .lock()
                .await
                .entry(id.to_string())
                .or_default(),
        )
    }

    /// Current instance for `id`. A spawn still in flight reports `Starting`.
    pub async fn get(&self, id: &str) -> Option<WorkerInstance> {
        let cell = self.instances.lock().await.get(id).cloned()?;
        match cell.try_lock() {
            Ok(slot) => slot.clone(),
            Err(_) => {
                let profile = self.profile(id).await?;
                Some(WorkerInstance::new(profile, WorkerStatus::Starting, 0))
            }
        }
    }

    pub async fn is_ready(&self, id: &str) -> bool {
        self.get(id).await.is_some_and(|i| i.is_ready())
    }

    /// Every tracked instance, sorted by profile id.
    pub async fn instances(&self) -> Vec<WorkerInstance> {
        let ids: Vec<String> = self.instances.lock().await.keys().cloned().collect();
        let mut instances = Vec::new();
        for id in ids {
            if let Some(instance) = self.get(&id).await {
                instances.push(instance);
            }
        }
        instances.sort_by(|a, b| a.profile.id.cmp(&b.profile.id));
        instances
    }

    /// Return the ready instance for `profile_id`, spawning it if needed.
    ///
    /// Concurrent calls for the same id queue on the profile's cell, so the
    /// second caller sees the first caller's instance instead of spawning again.
    pub async fn ensure(
        &self,
        profile_id: &str,
        options: EnsureOptions,
    ) -> Result<WorkerInstance, WorkerError> {
        let profile = self
            .profile(profile_id)
            .await
            .ok_or_else(|| WorkerError::UnknownProfile {
                id: profile_id.to_string(),
            })?;

        let cell = self.cell(profile_id).await;
        let mut slot = cell.lock().await;
        if let Some(instance) = slot.as_ref()
            && instance.is_ready()
        {
            return Ok(instance.clone());
        }

        let spawner = self
            .spawner
            .as_ref()
            .ok_or_else(|| WorkerError::SpawnNotConfigured {
                id: profile_id.to_string(),
            })?;

        let base_port = options
            .base_port
            .or(profile.base_port)
            .unwrap_or(self.config.base_port);
        let offset = self.next_port_offset.fetch_add(1, Ordering::Relaxed);
        let port = base_port
            .checked_add(offset)
            .ok_or_else(|| WorkerError::SpawnFailed {
                id: profile_id.to_string(),
                reason: format!("no free port above {base_port} (offset {offset})"),
            })?;
        let timeout = options
            .timeout
            .or(profile.spawn_timeout())
            .unwrap_or(self.config.spawn_timeout);

        info!(worker_id = %profile_id, port, "Spawning worker");
        let spawned = tokio::time::timeout(
            timeout,
            spawner.spawn(&profile, SpawnOptions { port, timeout }),
        )
        .await;

        let result = match spawned {
            Ok(Ok(mut instance)) if instance.is_ready() => {
                if instance.port == 0 {
                    instance.port = port;
                }
                Ok(instance)
            }
            Ok(Ok(instance)) => Err(WorkerError::SpawnFailed {
                id: profile_id.to_string(),
                reason: format!("worker reported status {}", instance.status),
            }),
            Ok(Err(e)) => Err(WorkerError::SpawnFailed {
                id: profile_id.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(WorkerError::SpawnTimeout {
                id: profile_id.to_string(),
                timeout,
            }),
        };

        match result {
            Ok(instance) => {
                info!(worker_id = %profile_id, port = instance.port, "Worker ready");
                *slot = Some(instance.clone());
                Ok(instance)
            }
            Err(e) => {
                warn!(worker_id = %profile_id, error = %e, "Worker spawn failed");
                *slot = Some(WorkerInstance::new(profile, WorkerStatus::Error, port));
                Err(e)
            }
        }
    }

    /// Stop one worker.
    ///
    /// The cell stays in the map so an `ensure` queued behind this stop
    /// respawns into the same cell rather than racing a fresh one.
    pub async fn stop(&self, id: &str) -> Result<(), WorkerError> {
        let Some(cell) = self.instances.lock().await.get(id).cloned() else {
            return Ok(());
        };
        self.stop_cell(id, cell).await
    }

    async fn stop_cell(&self, id: &str, cell: InstanceCell) -> Result<(), WorkerError> {
        let mut slot = cell.lock().await;
        let Some(mut instance) = slot.take() else {
            return Ok(());
        };
        if instance.status == WorkerStatus::Stopped {
            return Ok(());
        }
        let stopped = match &self.spawner {
            Some(spawner) => spawner.stop(&instance).await,
            None => Ok(()),
        };
        instance.status = WorkerStatus::Stopped;
        info!(worker_id = %id, "Worker stopped");
        stopped.map_err(|e| WorkerError::StopFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Stop every tracked worker and clear the pool. Cells are emptied in
    /// place, waiting out any spawn in flight.
    pub async fn stop_all(&self) {
        let cells: Vec<(String, InstanceCell)> = self
            .instances
            .lock()
            .await
            .iter()
            .map(|(id, cell)| (id.clone(), Arc::clone(cell)))
            .collect();
        let results = join_all(
            cells
                .into_iter()
                .map(|(id, cell)| async move { (self.stop_cell(&id, cell).await, id) }),
        )
        .await;
        for (result, id) in results {
            if let Err(e) = result {
                warn!(worker_id = %id, error = %e, "Failed to stop worker");
            }
        }
        self.next_port_offset.store(0, Ordering::Relaxed);
    }
}
