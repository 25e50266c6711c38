//! Worker profiles and their running instances.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Static description of a worker kind, loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProfile {
    pub id: String,
    /// Model or identity tag reported to dispatchers.
    pub model: String,
    /// Overrides the pool's base port for this profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_timeout_ms: Option<u64>,
    /// Executable launched by the process spawner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl WorkerProfile {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            base_port: None,
            spawn_timeout_ms: None,
            command: None,
            args: Vec::new(),
        }
    }

    /// Set the command (and arguments) used to launch this worker.
    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some(command.into());
        self.args = args;
        self
    }

    pub fn spawn_timeout(&self) -> Option<Duration> {
        self.spawn_timeout_ms.map(Duration::from_millis)
    }
}

/// Parse a JSON array of profiles, rejecting blank or duplicate ids.
pub fn parse_profiles(raw: &str) -> Result<Vec<WorkerProfile>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "worker profiles".to_string(),
        message,
    };
    let profiles: Vec<WorkerProfile> =
        serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;

    let mut seen = HashSet::new();
    for profile in &profiles {
        if profile.id.trim().is_empty() {
            return Err(invalid("profile id must not be empty".to_string()));
        }
        if !seen.insert(profile.id.as_str()) {
            return Err(invalid(format!("duplicate profile id {}", profile.id)));
        }
    }
    Ok(profiles)
}

/// Read and parse a profile list file.
pub async fn load_profiles(path: &Path) -> Result<Vec<WorkerProfile>, ConfigError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    parse_profiles(&raw)
}

/// Lifecycle of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Ready,
    Stopped,
    Error,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Runtime record of a spawned worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInstance {
    pub profile: WorkerProfile,
    pub status: WorkerStatus,
    /// Port the worker listens on. 0 means not yet known.
    pub port: u16,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl WorkerInstance {
    pub fn new(profile: WorkerProfile, status: WorkerStatus, port: u16) -> Self {
        Self {
            profile,
            status,
            port,
            started_at: Utc::now(),
            pid: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.profile.id
    }

    pub fn is_ready(&self) -> bool {
        self.status == WorkerStatus::Ready
    }
}

/// Parameters handed to a spawner for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Port assigned by the pool. Spawners may report a different one.
    pub port: u16,
    pub timeout: Duration,
}
