//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` constructor. Unset or
//! unparsable variables fall back to the default value.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Aggregate configuration for the orchestration core.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub concurrency: ConcurrencyConfig,
    pub jobs: JobConfig,
    pub workers: WorkerPoolConfig,
    pub protocol: ProtocolConfig,
    pub background: BackgroundConfig,
}

impl OrchestratorConfig {
    /// Load every section from `AGENT_TASKS_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            concurrency: ConcurrencyConfig::from_env(),
            jobs: JobConfig::from_env(),
            workers: WorkerPoolConfig::from_env(),
            protocol: ProtocolConfig::from_env(),
            background: BackgroundConfig::from_env(),
        }
    }

    /// Concurrency limits with the background session gate filled in from
    /// `background.default_concurrency`. An explicit key limit wins.
    pub fn gated_concurrency(&self) -> ConcurrencyConfig {
        let mut concurrency = self.concurrency.clone();
        concurrency
            .key_limits
            .entry(self.background.concurrency_key.clone())
            .or_insert(self.background.default_concurrency);
        concurrency
    }
}

/// Per-key concurrency limits.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Limit for keys without an explicit entry in `key_limits`.
    pub default_concurrency: usize,
    /// Explicit per-key limits.
    pub key_limits: HashMap<String, usize>,
    /// Default acquisition timeout. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 1,
            key_limits: HashMap::new(),
            acquire_timeout: None,
        }
    }
}

impl ConcurrencyConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_concurrency: env_parse("AGENT_TASKS_DEFAULT_CONCURRENCY")
                .unwrap_or(defaults.default_concurrency),
            key_limits: std::env::var("AGENT_TASKS_CONCURRENCY_LIMITS")
                .map(|raw| parse_key_limits(&raw))
                .unwrap_or_default(),
            acquire_timeout: env_millis("AGENT_TASKS_SLOT_TIMEOUT_MS"),
        }
    }

    /// Effective limit for a key. A configured limit of 0 is treated as 1.
    pub fn limit_for(&self, key: &str) -> usize {
        self.key_limits
            .get(key)
            .copied()
            .unwrap_or(self.default_concurrency)
            .max(1)
    }

    /// Builder-style override for a single key.
    pub fn with_limit(mut self, key: impl Into<String>, limit: usize) -> Self {
        self.key_limits.insert(key.into(), limit);
        self
    }
}

/// Job registry settings.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Timeout used by `await` when the caller does not supply one.
    pub default_await_timeout: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            default_await_timeout: Duration::from_secs(600),
        }
    }
}

impl JobConfig {
    pub fn from_env() -> Self {
        Self {
            default_await_timeout: env_millis("AGENT_TASKS_AWAIT_TIMEOUT_MS")
                .unwrap_or(Self::default().default_await_timeout),
        }
    }
}

/// Worker pool spawn defaults.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// First port handed to a spawned worker; later spawns increment from here.
    pub base_port: u16,
    /// How long a spawn may take before it is reported as failed.
    pub spawn_timeout: Duration,
    /// JSON file holding the worker profile list.
    pub profiles_path: Option<PathBuf>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            base_port: 14096,
            spawn_timeout: Duration::from_secs(30),
            profiles_path: None,
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_port: env_parse("AGENT_TASKS_WORKER_BASE_PORT").unwrap_or(defaults.base_port),
            spawn_timeout: env_millis("AGENT_TASKS_WORKER_SPAWN_TIMEOUT_MS")
                .unwrap_or(defaults.spawn_timeout),
            profiles_path: std::env::var("AGENT_TASKS_WORKER_PROFILES")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

/// Task protocol settings.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Attachments must resolve inside this directory.
    pub attachment_root: PathBuf,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            attachment_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl ProtocolConfig {
    pub fn from_env() -> Self {
        Self {
            attachment_root: std::env::var("AGENT_TASKS_ATTACHMENT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default().attachment_root),
        }
    }
}

/// Background task poller settings.
#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    /// Interval between poll ticks.
    pub poll_interval: Duration,
    /// A running task older than this is moved to `timeout`.
    pub task_timeout: Duration,
    /// Maximum number of background sessions held at once.
    pub default_concurrency: usize,
    /// Concurrency key used to gate session creation.
    pub concurrency_key: String,
    /// How long a launch waits for a session slot. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
    /// Number of finished tasks kept for `get`.
    pub history_limit: usize,
    /// Bound on each session query made while polling. A query that runs
    /// longer counts as no data.
    pub query_timeout: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            task_timeout: Duration::from_secs(30 * 60),
            default_concurrency: 5,
            concurrency_key: "background-session".to_string(),
            acquire_timeout: None,
            history_limit: 100,
            query_timeout: Duration::from_secs(10),
        }
    }
}

impl BackgroundConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_millis("AGENT_TASKS_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval),
            task_timeout: env_millis("AGENT_TASKS_TASK_TIMEOUT_MS")
                .unwrap_or(defaults.task_timeout),
            default_concurrency: env_parse("AGENT_TASKS_BACKGROUND_CONCURRENCY")
                .unwrap_or(defaults.default_concurrency),
            query_timeout: env_millis("AGENT_TASKS_QUERY_TIMEOUT_MS")
                .unwrap_or(defaults.query_timeout),
            ..defaults
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

/// Parse `key=n,key=n` into a limit map, skipping malformed entries.
fn parse_key_limits(raw: &str) -> HashMap<String, usize> {
    raw.split(',')
        .filter_map(|entry| {
            let (key, limit) = entry.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), limit.trim().parse().ok()?))
        })
        .collect()
}
