// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon mode implementation
//!
//! Handles:
//! - PID file management
//! - Liveness checks (PID plus the Prometheus endpoint when enabled)
//! - Graceful shutdown

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
#[cfg(unix)]
use tokio::time::sleep;
use tracing::info;
#[cfg(unix)]
use tracing::warn;

pub mod server;

pub use server::run_daemon;

#[cfg(unix)]
const PID_FILE: &str = "/var/run/aghub/aghub.pid";
#[cfg(unix)]
const PID_FILE_FALLBACK: &str = "/tmp/aghub.pid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: u32 },
    Stopped,
    Unhealthy { pid: u32, error: String },
}

/// Checks the local PID file and, when given, probes the metrics URL.
pub async fn check_daemon_running(metrics_url: Option<&str>) -> Result<DaemonStatus> {
    check_status_at(&get_pid_file_path(), metrics_url).await
}

pub async fn check_status_at(pid_file: &Path, metrics_url: Option<&str>) -> Result<DaemonStatus> {
    let local_pid = std::fs::read_to_string(pid_file)
        .ok()
        .and_then(|content| content.trim().parse::<u32>().ok());

    let pid = match local_pid {
        Some(pid) if process_exists(pid) => pid,
        Some(_) => {
            // Stale PID file
            let _ = std::fs::remove_file(pid_file);
            return Ok(DaemonStatus::Stopped);
        }
        None => return Ok(DaemonStatus::Stopped),
    };

    let Some(url) = metrics_url else {
        return Ok(DaemonStatus::Running { pid });
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()?;

    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => Ok(DaemonStatus::Running { pid }),
        Ok(resp) => Ok(DaemonStatus::Unhealthy {
            pid,
            error: format!("metrics endpoint returned HTTP {}", resp.status()),
        }),
        Err(e) => Ok(DaemonStatus::Unhealthy {
            pid,
            error: e.to_string(),
        }),
    }
}

/// Stop the daemon gracefully
pub async fn stop_daemon(force: bool, timeout_secs: u64) -> Result<()> {
    let pid_file = get_pid_file_path();

    let pid = std::fs::read_to_string(&pid_file)
        .context("Failed to read PID file")?
        .trim()
        .parse::<u32>()
        .context("Invalid PID")?;

    info!("Sending SIGTERM to process {}", pid);

    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGTERM)?;

        for _ in 0..timeout_secs {
            if !process_exists(pid) {
                info!("Daemon stopped gracefully");
                let _ = std::fs::remove_file(&pid_file);
                return Ok(());
            }
            sleep(Duration::from_secs(1)).await;
        }

        if force {
            warn!("Graceful shutdown timeout, sending SIGKILL");
            send_signal(pid, libc::SIGKILL)?;
            sleep(Duration::from_secs(1)).await;
        } else {
            anyhow::bail!("Daemon did not stop within {}s", timeout_secs);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (force, timeout_secs);
        anyhow::bail!("Stopping the daemon is only supported on unix hosts (pid {})", pid);
    }

    #[allow(unreachable_code)]
    {
        let _ = std::fs::remove_file(&pid_file);
        Ok(())
    }
}

pub fn get_pid_file_path() -> PathBuf {
    #[cfg(unix)]
    {
        let uid = unsafe { libc::geteuid() };
        if uid == 0 {
            PathBuf::from(PID_FILE)
        } else {
            PathBuf::from(PID_FILE_FALLBACK)
        }
    }

    #[cfg(not(unix))]
    {
        std::env::temp_dir().join("aghub.pid")
    }
}

fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<()> {
    unsafe {
        if libc::kill(pid as i32, signal) != 0 {
            anyhow::bail!("Failed to send signal {} to process {}", signal, pid);
        }
    }
    Ok(())
}

pub fn write_pid_file(pid: u32) -> Result<()> {
    let pid_file = get_pid_file_path();
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {:?}", parent))?;
    }
    std::fs::write(&pid_file, pid.to_string())
        .with_context(|| format!("Failed to write PID file: {:?}", pid_file))?;
    info!("Wrote PID file: {:?}", pid_file);
    Ok(())
}

pub fn remove_pid_file() -> Result<()> {
    let pid_file = get_pid_file_path();
    if pid_file.exists() {
        std::fs::remove_file(&pid_file)
            .with_context(|| format!("Failed to remove PID file: {:?}", pid_file))?;
        info!("Removed PID file: {:?}", pid_file);
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_pid_file_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let status = check_status_at(&dir.path().join("aghub.pid"), None).await.unwrap();
        assert_eq!(status, DaemonStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stale_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("aghub.pid");
        // Far above any default pid_max.
        std::fs::write(&pid_file, "999999999").unwrap();

        let status = check_status_at(&pid_file, None).await.unwrap();
        assert_eq!(status, DaemonStatus::Stopped);
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_live_process_with_metrics_probe() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("aghub.pid");
        let pid = std::process::id();
        std::fs::write(&pid_file, pid.to_string()).unwrap();

        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/metrics")
            .with_status(200)
            .with_body("aghub_deployments_active 1\n")
            .create_async()
            .await;
        let url = format!("{}/metrics", server.url());
        let status = check_status_at(&pid_file, Some(&url)).await.unwrap();
        assert_eq!(status, DaemonStatus::Running { pid });
        ok.assert_async().await;

        let broken = format!("{}/missing", server.url());
        server
            .mock("GET", "/missing")
            .with_status(503)
            .create_async()
            .await;
        let status = check_status_at(&pid_file, Some(&broken)).await.unwrap();
        assert!(matches!(status, DaemonStatus::Unhealthy { pid: p, .. } if p == pid));
    }
}
