// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Docker adapter for [`ContainerRuntime`].
//!
//! Responses whose model shape drifts between Docker API versions (stats,
//! inspect, build progress) are read through their JSON wire names rather
//! than typed fields.

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, InspectContainerOptionsBuilder,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder,
    StatsOptionsBuilder, StopContainerOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::runtime::{
    BuildContext, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats, ExecOutput,
    RuntimeError,
};
use crate::infrastructure::build_context;

const DOCKER_TIMEOUT_SECS: u64 = 120;

pub struct DockerContainerRuntime {
    docker: Docker,
}

impl DockerContainerRuntime {
    /// Connects to `socket` (unix path or `tcp://`/`http://` URL), or the
    /// local defaults when unset.
    pub fn connect(socket: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match socket {
            Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http://") => {
                Docker::connect_with_http(addr, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(path) => Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| {
            RuntimeError::ConnectionFailed(format!(
                "Failed to connect to Docker{}: {}\n\n\
                 Ensure the Docker daemon is running and the socket is accessible.",
                socket.map(|s| format!(" at {}", s)).unwrap_or_default(),
                e
            ))
        })?;

        Ok(Self { docker })
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(|e| {
            RuntimeError::ConnectionFailed(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code: 404, .. }
    )
}

fn not_found_or(name: &str, error: BollardError, wrap: fn(String) -> RuntimeError) -> RuntimeError {
    if is_not_found_error(&error) {
        RuntimeError::ContainerNotFound(name.to_string())
    } else {
        wrap(error.to_string())
    }
}

fn json_u64(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(Value::as_u64)
}

/// Reads the Docker stats document (`cpu_stats`, `precpu_stats`, `memory_stats`,
/// `networks`, `blkio_stats`).
pub(crate) fn parse_stats(doc: &Value) -> ContainerStats {
    let online_cpus = json_u64(doc, "/cpu_stats/online_cpus")
        .filter(|n| *n > 0)
        .or_else(|| {
            doc.pointer("/cpu_stats/cpu_usage/percpu_usage")
                .and_then(Value::as_array)
                .map(|cpus| cpus.len() as u64)
        })
        .unwrap_or(1) as u32;

    let (network_rx_bytes, network_tx_bytes) = doc
        .get("networks")
        .and_then(Value::as_object)
        .map(|networks| {
            networks.values().fold((0u64, 0u64), |(rx, tx), iface| {
                (
                    rx.saturating_add(json_u64(iface, "/rx_bytes").unwrap_or(0)),
                    tx.saturating_add(json_u64(iface, "/tx_bytes").unwrap_or(0)),
                )
            })
        })
        .unwrap_or((0, 0));

    let (block_read_bytes, block_write_bytes) = doc
        .pointer("/blkio_stats/io_service_bytes_recursive")
        .and_then(Value::as_array)
        .map(|entries| {
            entries.iter().fold((0u64, 0u64), |(read, write), entry| {
                let op = entry.get("op").and_then(Value::as_str).unwrap_or_default();
                let bytes = json_u64(entry, "/value").unwrap_or(0);
                match op.to_ascii_lowercase().as_str() {
                    "read" => (read.saturating_add(bytes), write),
                    "write" => (read, write.saturating_add(bytes)),
                    _ => (read, write),
                }
            })
        })
        .unwrap_or((0, 0));

    ContainerStats {
        cpu_total_usage: json_u64(doc, "/cpu_stats/cpu_usage/total_usage").unwrap_or(0),
        precpu_total_usage: json_u64(doc, "/precpu_stats/cpu_usage/total_usage").unwrap_or(0),
        system_cpu_usage: json_u64(doc, "/cpu_stats/system_cpu_usage"),
        presystem_cpu_usage: json_u64(doc, "/precpu_stats/system_cpu_usage"),
        online_cpus,
        memory_usage_bytes: json_u64(doc, "/memory_stats/usage").unwrap_or(0),
        network_rx_bytes,
        network_tx_bytes,
        block_read_bytes,
        block_write_bytes,
        storage_bytes: None,
        read_at: json_timestamp(doc, "/read"),
        preread_at: json_timestamp(doc, "/preread"),
    }
}

fn json_timestamp(doc: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    doc.pointer(pointer)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Build progress line: `stream` text or an `error`/`errorDetail.message`.
fn parse_build_line(doc: &Value) -> Result<Option<String>, String> {
    if let Some(error) = doc
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| doc.pointer("/errorDetail/message").and_then(Value::as_str))
        .or_else(|| doc.pointer("/error_detail/message").and_then(Value::as_str))
    {
        return Err(error.to_string());
    }
    Ok(doc
        .get("stream")
        .and_then(Value::as_str)
        .map(|s| s.trim_end().to_string())
        .filter(|s| !s.is_empty()))
}

fn log_line(output: LogOutput) -> Option<(bool, String)> {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            Some((false, String::from_utf8_lossy(&message).into_owned()))
        }
        LogOutput::StdErr { message } => Some((true, String::from_utf8_lossy(&message).into_owned())),
        LogOutput::StdIn { .. } => None,
    }
}

#[async_trait]
impl ContainerRuntime for DockerContainerRuntime {
    async fn build_image(
        &self,
        image: &str,
        context: BuildContext,
    ) -> Result<Vec<String>, RuntimeError> {
        let archive = build_context::to_tar(&context)
            .map_err(|e| RuntimeError::BuildFailed {
                message: format!("Failed to pack build context: {}", e),
                logs: Vec::new(),
            })?;

        let options = BuildImageOptionsBuilder::new()
            .t(image)
            .dockerfile(build_context::DOCKERFILE)
            .rm(true)
            .forcerm(true)
            .build();

        info!(image = %image, files = context.len(), "Building image");
        let mut stream = self
            .docker
            .build_image(options, None, Some(bollard::body_full(archive.into())));

        let mut logs = Vec::new();
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| RuntimeError::BuildFailed {
                message: e.to_string(),
                logs: logs.clone(),
            })?;
            let doc = serde_json::to_value(&info).unwrap_or(Value::Null);
            match parse_build_line(&doc) {
                Ok(Some(line)) => {
                    debug!(image = %image, "{}", line);
                    logs.push(line);
                }
                Ok(None) => {}
                Err(message) => {
                    logs.push(message.clone());
                    return Err(RuntimeError::BuildFailed { message, logs });
                }
            }
        }

        info!(image = %image, "Image built");
        Ok(logs)
    }

    async fn run_container(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
        let port_bindings = spec.port.map(|mapping| {
            HashMap::from([(
                format!("{}/tcp", mapping.internal),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(mapping.external.to_string()),
                }]),
            )])
        });

        let host_config = HostConfig {
            port_bindings,
            memory: spec.memory_limit_bytes.map(|bytes| bytes.min(i64::MAX as u64) as i64),
            // 1 milli CPU = 1e6 nano CPUs
            nano_cpus: spec.cpu_millis.map(|millis| i64::from(millis) * 1_000_000),
            ..HostConfig::default()
        };

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            cmd: spec.command.clone(),
            host_config: Some(host_config),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                config,
            )
            .await
            .map_err(|e| RuntimeError::StartFailed(format!("create {}: {}", spec.name, e)))?;

        self.docker
            .start_container(&spec.name, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| RuntimeError::StartFailed(format!("start {}: {}", spec.name, e)))?;

        info!(container = %spec.name, id = %created.id, "Container started");
        Ok(created.id)
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        let secs = grace.as_secs().min(i32::MAX as u64) as i32;
        match self
            .docker
            .stop_container(name, Some(StopContainerOptionsBuilder::new().t(secs).build()))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(not_found_or(name, e, RuntimeError::StopFailed)),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
            .map_err(|e| not_found_or(name, e, RuntimeError::StopFailed))
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        let inspect = match self
            .docker
            .inspect_container(name, Some(InspectContainerOptionsBuilder::new().size(true).build()))
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_not_found_error(&e) => return Ok(None),
            Err(e) => return Err(RuntimeError::Other(e.to_string())),
        };

        let doc = serde_json::to_value(&inspect).map_err(|e| RuntimeError::Other(e.to_string()))?;
        Ok(Some(ContainerState {
            id: doc.get("Id").and_then(Value::as_str).unwrap_or(name).to_string(),
            running: doc.pointer("/State/Running").and_then(Value::as_bool).unwrap_or(false),
            status: doc
                .pointer("/State/Status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            exit_code: doc.pointer("/State/ExitCode").and_then(Value::as_i64),
        }))
    }

    async fn stats(&self, name: &str) -> Result<ContainerStats, RuntimeError> {
        // A non-streaming read waits for one sample so `precpu_stats` is filled.
        let options = StatsOptionsBuilder::new().stream(false).one_shot(false).build();
        let sample = self
            .docker
            .stats(name, Some(options))
            .next()
            .await
            .ok_or_else(|| RuntimeError::StatsUnavailable(format!("no stats sample for {}", name)))?
            .map_err(|e| not_found_or(name, e, RuntimeError::StatsUnavailable))?;

        let doc = serde_json::to_value(&sample).map_err(|e| RuntimeError::StatsUnavailable(e.to_string()))?;
        let mut stats = parse_stats(&doc);

        match self
            .docker
            .inspect_container(name, Some(InspectContainerOptionsBuilder::new().size(true).build()))
            .await
        {
            Ok(inspect) => {
                stats.storage_bytes = serde_json::to_value(&inspect)
                    .ok()
                    .and_then(|doc| doc.get("SizeRw").and_then(Value::as_u64));
            }
            Err(e) => debug!(container = %name, "Size lookup failed: {}", e),
        }

        Ok(stats)
    }

    async fn exec(&self, name: &str, cmd: Vec<String>) -> Result<ExecOutput, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| not_found_or(name, e, RuntimeError::ExecFailed))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk.map(log_line) {
                    Ok(Some((false, text))) => stdout.push_str(&text),
                    Ok(Some((true, text))) => stderr.push_str(&text),
                    Ok(None) => {}
                    Err(e) => return Err(RuntimeError::ExecFailed(e.to_string())),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::ExecFailed(format!("Failed to inspect exec: {}", e)))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, RuntimeError> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&tail.to_string())
            .build();

        let mut stream = self.docker.logs(name, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => {
                    if let Some((_, text)) = log_line(output) {
                        lines.extend(text.lines().map(str::to_string));
                    }
                }
                Err(e) if is_not_found_error(&e) => {
                    return Err(RuntimeError::ContainerNotFound(name.to_string()))
                }
                Err(e) => {
                    warn!(container = %name, "Log stream ended early: {}", e);
                    break;
                }
            }
        }
        Ok(lines)
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_image(image, Some(RemoveImageOptionsBuilder::new().force(true).build()), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found_error(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Other(format!("remove image {}: {}", image, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_stats_sums_interfaces_and_block_io() {
        let doc = json!({
            "cpu_stats": {
                "cpu_usage": { "total_usage": 400 },
                "system_cpu_usage": 10_000,
                "online_cpus": 2
            },
            "precpu_stats": {
                "cpu_usage": { "total_usage": 100 },
                "system_cpu_usage": 9_000
            },
            "memory_stats": { "usage": 1_048_576 },
            "networks": {
                "eth0": { "rx_bytes": 10, "tx_bytes": 20 },
                "eth1": { "rx_bytes": 1, "tx_bytes": 2 }
            },
            "blkio_stats": {
                "io_service_bytes_recursive": [
                    { "op": "Read", "value": 4096 },
                    { "op": "write", "value": 512 },
                    { "op": "Total", "value": 4608 }
                ]
            }
        });

        let stats = parse_stats(&doc);
        assert_eq!(stats.cpu_delta(), 300);
        assert_eq!(stats.system_delta(), Some(1_000));
        assert_eq!(stats.online_cpus, 2);
        assert_eq!(stats.memory_usage_bytes, 1_048_576);
        assert_eq!(stats.network_total_bytes(), 33);
        assert_eq!((stats.block_read_bytes, stats.block_write_bytes), (4096, 512));
    }

    #[test]
    fn test_parse_stats_without_host_counter() {
        let doc = json!({
            "cpu_stats": { "cpu_usage": { "total_usage": 5, "percpu_usage": [1, 2, 2] } },
            "precpu_stats": { "cpu_usage": { "total_usage": 0 } }
        });
        let stats = parse_stats(&doc);
        assert_eq!(stats.system_delta(), None);
        assert_eq!(stats.online_cpus, 3);
        assert_eq!(stats.network_total_bytes(), 0);
        assert_eq!(stats.sample_window(), None);
    }

    #[test]
    fn test_parse_stats_reads_the_sample_window() {
        let doc = json!({
            "read": "2026-03-14T10:00:01.250000000Z",
            "preread": "2026-03-14T10:00:00.250000000Z",
            "cpu_stats": { "cpu_usage": { "total_usage": 2_000_000_000u64 } },
            "precpu_stats": { "cpu_usage": { "total_usage": 1_000_000_000u64 } }
        });
        let stats = parse_stats(&doc);
        assert_eq!(stats.sample_window(), Some(Duration::from_secs(1)));

        let first = parse_stats(&json!({
            "read": "2026-03-14T10:00:01Z",
            "preread": "0001-01-01T00:00:00Z"
        }));
        assert!(first.read_at.is_some());
        assert_eq!(first.sample_window(), None);
    }

    #[test]
    fn test_parse_build_line() {
        assert_eq!(
            parse_build_line(&json!({"stream": "Step 1/4 : FROM python\n"})),
            Ok(Some("Step 1/4 : FROM python".to_string()))
        );
        assert_eq!(parse_build_line(&json!({"stream": "\n"})), Ok(None));
        assert_eq!(
            parse_build_line(&json!({"errorDetail": {"message": "pip failed"}})),
            Err("pip failed".to_string())
        );
    }
}
