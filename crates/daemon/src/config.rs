// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration file
//!
//! ```toml
//! node_id = "node-a"
//! host = "node-a.example"
//! ports = [6700, 6701]
//! state_dir = "/var/lib/slotd"
//! blob_source_dir = "/srv/blobs"
//! cluster_state_dir = "/srv/cluster"
//!
//! [worker]
//! command = ["/opt/worker/bin/run", "{topology_id}", "{port}"]
//!
//! [slot]
//! heartbeat_timeout = "30s"
//! ```

use serde::Deserialize;
use slotd_adapters::ProcessLauncherConfig;
use slotd_core::Port;
use slotd_engine::{AgentConfig, SlotConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub node_id: String,
    /// Hostname profile requests are addressed to; defaults to the node id
    #[serde(default)]
    pub host: Option<String>,
    pub ports: Vec<Port>,
    pub state_dir: PathBuf,
    /// Defaults to `<state_dir>/slotd.log`
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    pub blob_source_dir: PathBuf,
    pub cluster_state_dir: PathBuf,
    #[serde(default = "default_drain")]
    pub drain_on_shutdown: bool,
    pub worker: WorkerSection,
    #[serde(default)]
    pub slot: SlotSection,
    #[serde(default)]
    pub agent: AgentSection,
}

fn default_drain() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    /// Worker argv with `{topology_id}`, `{port}`, `{worker_id}`,
    /// `{worker_dir}` and `{blob_dir}` placeholders
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Profiler argv with `{pid}`, `{action}` and `{worker_dir}` placeholders
    #[serde(default)]
    pub profiler_command: Option<Vec<String>>,
    #[serde(default)]
    pub enforce_memory_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlotSection {
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub first_heartbeat_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub kill_sleep: Duration,
    #[serde(with = "humantime_serde")]
    pub monitor_frequency: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_granularity: Duration,
    #[serde(with = "humantime_serde")]
    pub download_retry: Duration,
    #[serde(with = "humantime_serde")]
    pub kill_ceiling: Duration,
}

impl Default for SlotSection {
    fn default() -> Self {
        let defaults = SlotConfig::default();
        Self {
            heartbeat_timeout: defaults.heartbeat_timeout,
            first_heartbeat_timeout: defaults.first_heartbeat_timeout,
            kill_sleep: defaults.kill_sleep,
            monitor_frequency: defaults.monitor_frequency,
            poll_granularity: defaults.poll_granularity,
            download_retry: defaults.download_retry,
            kill_ceiling: defaults.kill_ceiling,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    #[serde(with = "humantime_serde")]
    pub assignment_sync: Duration,
    #[serde(with = "humantime_serde")]
    pub node_heartbeat: Duration,
    #[serde(with = "humantime_serde")]
    pub blob_update_check: Duration,
    #[serde(with = "humantime_serde")]
    pub blob_cleanup: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_sleep: Duration,
    #[serde(with = "humantime_serde")]
    pub force_kill_wait: Duration,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = AgentConfig::new("", "", Vec::new());
        Self {
            assignment_sync: defaults.assignment_sync,
            node_heartbeat: defaults.node_heartbeat,
            blob_update_check: defaults.blob_update_check,
            blob_cleanup: defaults.blob_cleanup,
            shutdown_sleep: defaults.shutdown_sleep,
            force_kill_wait: defaults.force_kill_wait,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse(_, source) => ConfigError::Parse(path.to_path_buf(), source),
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::Invalid("node_id is empty".to_string()));
        }
        if self.ports.is_empty() {
            return Err(ConfigError::Invalid("no ports configured".to_string()));
        }
        let mut seen = self.ports.clone();
        seen.sort_unstable();
        if let Some(pair) = seen.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid(format!("port {} listed twice", pair[0])));
        }
        if self.worker.command.is_empty() {
            return Err(ConfigError::Invalid("worker.command is empty".to_string()));
        }
        Ok(())
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(&self.node_id)
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("slotd.log"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("slotd.lock")
    }

    pub fn local_state_path(&self) -> PathBuf {
        self.state_dir.join("local-state.wal")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.state_dir.join("blobs")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.state_dir.join("workers")
    }

    pub fn slot_config(&self) -> SlotConfig {
        let slot = &self.slot;
        SlotConfig {
            heartbeat_timeout: slot.heartbeat_timeout,
            first_heartbeat_timeout: slot.first_heartbeat_timeout,
            kill_sleep: slot.kill_sleep,
            monitor_frequency: slot.monitor_frequency,
            poll_granularity: slot.poll_granularity,
            download_retry: slot.download_retry,
            kill_ceiling: slot.kill_ceiling,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        let agent = &self.agent;
        AgentConfig {
            slot: self.slot_config(),
            assignment_sync: agent.assignment_sync,
            node_heartbeat: agent.node_heartbeat,
            blob_update_check: agent.blob_update_check,
            blob_cleanup: agent.blob_cleanup,
            shutdown_sleep: agent.shutdown_sleep,
            force_kill_wait: agent.force_kill_wait,
            drain_on_shutdown: self.drain_on_shutdown,
            ..AgentConfig::new(self.node_id.clone(), self.host(), self.ports.clone())
        }
    }

    pub fn launcher_config(&self) -> ProcessLauncherConfig {
        ProcessLauncherConfig {
            host: self.host().to_string(),
            workers_dir: self.workers_dir(),
            blob_dir: self.blob_dir(),
            command: self.worker.command.clone(),
            env: self
                .worker
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            profiler_command: self.worker.profiler_command.clone(),
            enforce_memory_limit: self.worker.enforce_memory_limit,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
