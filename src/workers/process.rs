//! Process-backed worker spawner.
//!
//! Launches `profile.command` with the assigned port in `WORKER_PORT` and
//! waits for the child to print a line starting with `ready`. A worker that
//! binds its own port reports it as `ready <port>`.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::workers::pool::WorkerSpawner;
use crate::workers::profile::{SpawnOptions, WorkerInstance, WorkerProfile, WorkerStatus};

/// Spawns each worker as a child process and kills it on stop.
#[derive(Default)]
pub struct ProcessSpawner {
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live children.
    pub async fn running(&self) -> usize {
        self.children.lock().await.len()
    }
}

/// Parse a readiness line. Returns the port the worker is listening on.
fn parse_ready(line: &str, assigned: u16) -> Option<u16> {
    let line = line.trim();
    let rest = line
        .get(..5)
        .filter(|prefix| prefix.eq_ignore_ascii_case("ready"))
        .map(|_| &line[5..])?;
    if rest.is_empty() {
        return Some(assigned);
    }
    if !rest.starts_with(|c: char| c.is_whitespace() || c == ':') {
        return None;
    }
    let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ':');
    Some(rest.parse().unwrap_or(assigned))
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        profile: &WorkerProfile,
        options: SpawnOptions,
    ) -> anyhow::Result<WorkerInstance> {
        let Some(command) = profile.command.as_deref() else {
            bail!("worker {} has no command configured", profile.id);
        };

        // kill_on_drop covers the pool abandoning a spawn at its timeout.
        let mut child = Command::new(command)
            .args(&profile.args)
            .env("WORKER_PORT", options.port.to_string())
            .env("WORKER_ID", &profile.id)
            .env("WORKER_MODEL", &profile.model)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {command}"))?;

        let stdout = child.stdout.take().context("worker stdout was not captured")?;
        let mut lines = BufReader::new(stdout).lines();

        let port = loop {
            match lines.next_line().await? {
                Some(line) => {
                    debug!(worker_id = %profile.id, line = %line, "Worker output");
                    if let Some(port) = parse_ready(&line, options.port) {
                        break port;
                    }
                }
                None => bail!("worker {} exited before reporting ready", profile.id),
            }
        };

        // Keep draining so the child never blocks on a full pipe.
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

        let mut instance = WorkerInstance::new(profile.clone(), WorkerStatus::Ready, port);
        instance.pid = child.id();
        info!(worker_id = %profile.id, pid = ?instance.pid, port, "Worker process ready");

        self.children.lock().await.insert(profile.id.clone(), child);
        Ok(instance)
    }

    async fn stop(&self, instance: &WorkerInstance) -> anyhow::Result<()> {
        let Some(mut child) = self.children.lock().await.remove(instance.id()) else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            child
                .kill()
                .await
                .with_context(|| format!("failed to kill worker {}", instance.id()))?;
        }
        Ok(())
    }
}
