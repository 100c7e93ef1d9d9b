// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon lifecycle management commands
//!
//! Commands: run, start, stop, status

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::daemon::{check_daemon_running, get_pid_file_path, run_daemon, stop_daemon, DaemonStatus};
use aghub_orchestrator_core::domain::node_config::OrchestratorConfigManifest;

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Run the orchestrator in the foreground
    Run,

    /// Start the daemon in the background (if not already running)
    Start,

    /// Stop the daemon gracefully
    Stop {
        /// Force kill if daemon doesn't stop gracefully
        #[arg(short, long)]
        force: bool,

        /// Timeout in seconds (default: 30)
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Check daemon status
    Status,
}

pub async fn handle_command(command: DaemonCommand, config_path: Option<PathBuf>) -> Result<()> {
    match command {
        DaemonCommand::Run => run_daemon(config_path).await,
        DaemonCommand::Start => start(config_path).await,
        DaemonCommand::Stop { force, timeout } => stop(force, timeout).await,
        DaemonCommand::Status => status(config_path).await,
    }
}

/// Local URL of the Prometheus listener, when the config enables one.
fn metrics_probe_url(config_path: Option<PathBuf>) -> Option<String> {
    let config = OrchestratorConfigManifest::load_or_default(config_path).ok()?;
    let metrics = config.spec.observability.metrics.filter(|m| m.enabled)?;
    let host = match metrics.bind_address.as_str() {
        "0.0.0.0" | "::" => "127.0.0.1".to_string(),
        other => other.to_string(),
    };
    Some(format!("http://{}:{}/metrics", host, metrics.port))
}

async fn start(config_path: Option<PathBuf>) -> Result<()> {
    let config = OrchestratorConfigManifest::load_or_default(config_path.clone())
        .context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    info!("Checking if daemon is already running...");

    match check_daemon_running(metrics_probe_url(config_path.clone()).as_deref()).await {
        Ok(DaemonStatus::Running { pid }) => {
            println!("{}", format!("✓ Daemon already running (PID: {})", pid).green());
            println!("Use 'aghub daemon stop' to stop it first.");
            return Ok(());
        }
        Ok(DaemonStatus::Stopped) => {
            info!("Daemon not running, starting...");
        }
        Ok(DaemonStatus::Unhealthy { pid, error }) => {
            warn!("Daemon PID {} exists but unhealthy (error: {}), stopping...", pid, error);
            stop_daemon(false, 10).await?;
        }
        Err(e) => {
            warn!("Failed to check daemon status: {}", e);
        }
    }

    let current_exe =
        std::env::current_exe().context("Failed to get current executable path")?;

    let mut cmd = std::process::Command::new(current_exe);
    if let Some(config) = config_path {
        cmd.arg("--config").arg(config);
    }
    cmd.arg("daemon").arg("run");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let temp_dir = std::env::temp_dir();
    let stdout_path = temp_dir.join("aghub.out");
    let stderr_path = temp_dir.join("aghub.err");

    let stdout_file =
        std::fs::File::create(&stdout_path).context("Failed to create stdout log file")?;
    let stderr_file =
        std::fs::File::create(&stderr_path).context("Failed to create stderr log file")?;

    cmd.stdin(std::process::Stdio::null())
        .stdout(stdout_file)
        .stderr(stderr_file);

    println!("Redirecting logs to: {}", stdout_path.display());

    let child = cmd.spawn().context("Failed to spawn daemon process")?;

    println!(
        "{}",
        format!("✓ Daemon starting (PID: {})", child.id()).green()
    );
    println!("Check status with: aghub daemon status");

    Ok(())
}

async fn stop(force: bool, timeout: u64) -> Result<()> {
    info!("Stopping daemon...");

    match check_daemon_running(None).await {
        Ok(DaemonStatus::Stopped) => {
            println!("{}", "ℹ Daemon not running".yellow());
            return Ok(());
        }
        Ok(DaemonStatus::Running { pid }) | Ok(DaemonStatus::Unhealthy { pid, .. }) => {
            println!("Stopping daemon (PID: {})...", pid);
            stop_daemon(force, timeout).await?;
            println!("{}", "✓ Daemon stopped".green());
        }
        Err(e) => {
            println!("{}", format!("✗ Failed to check daemon: {}", e).red());
            return Err(e);
        }
    }

    Ok(())
}

async fn status(config_path: Option<PathBuf>) -> Result<()> {
    match check_daemon_running(metrics_probe_url(config_path).as_deref()).await {
        Ok(DaemonStatus::Running { pid }) => {
            println!("{}", "✓ Daemon is running".green());
            println!("  PID: {}", pid);
            if let Some(uptime) = pid_file_age_secs() {
                println!("  Uptime: {}", format_duration(uptime));
            }
        }
        Ok(DaemonStatus::Stopped) => {
            println!("{}", "✗ Daemon is not running".red());
        }
        Ok(DaemonStatus::Unhealthy { pid, error }) => {
            println!(
                "{}",
                format!("⚠ Daemon unhealthy (PID: {})", pid).yellow()
            );
            println!("  Process exists but metrics check failed: {}", error);
            println!("  Check logs at /tmp/aghub.out and /tmp/aghub.err");
        }
        Err(e) => {
            println!("{}", format!("✗ Failed to check status: {}", e).red());
            return Err(e);
        }
    }

    Ok(())
}

/// The PID file is written once at startup, so its age is the uptime.
fn pid_file_age_secs() -> Option<u64> {
    let modified = std::fs::metadata(get_pid_file_path()).ok()?.modified().ok()?;
    modified.elapsed().ok().map(|age| age.as_secs())
}

fn format_duration(secs: u64) -> String {
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3 * 3600 + 120), "3h 2m");
        assert_eq!(format_duration(2 * 86400 + 3600), "2d 1h 0m");
    }

    #[test]
    fn test_metrics_probe_url_rewrites_wildcard_bind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aghub-config.yaml");
        std::fs::write(
            &path,
            "apiVersion: aghub.dev/v1\nkind: OrchestratorConfig\nmetadata:\n  name: test\nspec:\n  observability:\n    metrics:\n      port: 9500\n",
        )
        .unwrap();
        assert_eq!(
            metrics_probe_url(Some(path)).as_deref(),
            Some("http://127.0.0.1:9500/metrics")
        );
    }
}
