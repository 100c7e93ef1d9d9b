// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Container runtime port.
//!
//! The engine talks to a Docker-API-compatible runtime through
//! [`ContainerRuntime`]. `DockerContainerRuntime` in the infrastructure layer
//! is the production adapter; tests script a fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

/// Files making up an image build context, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildContext {
    files: BTreeMap<String, Vec<u8>>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub internal: u16,
    pub external: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub port: Option<PortMapping>,
    pub command: Option<Vec<String>>,
    pub memory_limit_bytes: Option<u64>,
    pub cpu_millis: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub running: bool,
    pub status: String,
    pub exit_code: Option<i64>,
}

/// Raw counters from one stats read. Docker reports CPU in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_total_usage: u64,
    pub precpu_total_usage: u64,
    /// Host-level counters are missing on some platforms (cgroup v2 rootless, Windows).
    pub system_cpu_usage: Option<u64>,
    pub presystem_cpu_usage: Option<u64>,
    pub online_cpus: u32,
    pub memory_usage_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub storage_bytes: Option<u64>,
    /// When this sample and the one the `pre*` counters come from were taken.
    pub read_at: Option<DateTime<Utc>>,
    pub preread_at: Option<DateTime<Utc>>,
}

impl ContainerStats {
    pub fn cpu_delta(&self) -> u64 {
        self.cpu_total_usage.saturating_sub(self.precpu_total_usage)
    }

    pub fn system_delta(&self) -> Option<u64> {
        match (self.system_cpu_usage, self.presystem_cpu_usage) {
            (Some(now), Some(before)) if now > before => Some(now - before),
            _ => None,
        }
    }

    /// Wall time between the two CPU samples. Docker sends a zero `preread`
    /// on the first read of a stream, which yields `None`.
    pub fn sample_window(&self) -> Option<Duration> {
        let (read, preread) = (self.read_at?, self.preread_at?);
        if preread.timestamp() <= 0 {
            return None;
        }
        (read - preread).to_std().ok().filter(|window| !window.is_zero())
    }

    pub fn network_total_bytes(&self) -> u64 {
        self.network_rx_bytes.saturating_add(self.network_tx_bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to connect to container runtime: {0}")]
    ConnectionFailed(String),
    #[error("Image build failed: {message}")]
    BuildFailed { message: String, logs: Vec<String> },
    #[error("Failed to start container: {0}")]
    StartFailed(String),
    #[error("Container not found: {0}")]
    ContainerNotFound(String),
    #[error("Failed to stop container: {0}")]
    StopFailed(String),
    #[error("Exec failed: {0}")]
    ExecFailed(String),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Stats unavailable: {0}")]
    StatsUnavailable(String),
    #[error("Container runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::ContainerNotFound(_))
    }

    /// Logs captured alongside the error, if any.
    pub fn logs(&self) -> Vec<String> {
        match self {
            RuntimeError::BuildFailed { logs, .. } => logs.clone(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Builds `image` from `context`, returning the build log lines.
    async fn build_image(&self, image: &str, context: BuildContext) -> Result<Vec<String>, RuntimeError>;

    /// Creates and starts a container, returning its runtime id.
    async fn run_container(&self, spec: ContainerSpec) -> Result<String, RuntimeError>;

    /// Stops a container. Absent containers yield `ContainerNotFound`.
    async fn stop_container(&self, name: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Force-removes a container. Absent containers yield `ContainerNotFound`.
    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// `None` when the runtime does not know the container.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError>;

    async fn stats(&self, name: &str) -> Result<ContainerStats, RuntimeError>;

    /// Runs `cmd` inside a running container and waits for it to exit.
    async fn exec(&self, name: &str, cmd: Vec<String>) -> Result<ExecOutput, RuntimeError>;

    /// Last `tail` lines of combined stdout/stderr.
    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, RuntimeError>;

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;
}
