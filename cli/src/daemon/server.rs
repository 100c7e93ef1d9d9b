// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Foreground daemon: wires the orchestrator from config and runs until
//! SIGINT/SIGTERM.

use anyhow::{Context, Result};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aghub_orchestrator_core::application::{Orchestrator, Repositories};
use aghub_orchestrator_core::domain::node_config::{MetricsConfig, OrchestratorConfigManifest};
use aghub_orchestrator_core::domain::repository::StorageBackend;
use aghub_orchestrator_core::infrastructure::agent_client::HttpAgentClient;
use aghub_orchestrator_core::infrastructure::db::Database;
use aghub_orchestrator_core::infrastructure::runtime::DockerContainerRuntime;

use super::{remove_pid_file, write_pid_file};

pub async fn run_daemon(config_path: Option<PathBuf>) -> Result<()> {
    let manifest = OrchestratorConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;
    manifest.validate().context("Configuration validation failed")?;
    let spec = &manifest.spec;

    info!(
        "Starting aghub orchestrator '{}' ({})",
        manifest.metadata.name,
        env!("CARGO_PKG_VERSION")
    );

    write_pid_file(std::process::id())?;
    let _guard = PidFileGuard;

    if let Some(metrics) = spec.observability.metrics.as_ref().filter(|m| m.enabled) {
        install_metrics_exporter(metrics)?;
    }

    let repositories = connect_repositories(&manifest).await?;

    let runtime = DockerContainerRuntime::connect(spec.runtime.docker_socket.as_deref())?;
    runtime.healthcheck().await?;
    info!("Connected to Docker");

    let orchestrator = Arc::new(Orchestrator::new(
        spec,
        repositories,
        Arc::new(runtime),
        Arc::new(HttpAgentClient::new()),
    ));

    let sweep_token = CancellationToken::new();
    let collector = orchestrator.start_background_tasks();
    let sweeper = spawn_expiry_sweep(
        orchestrator.clone(),
        spec.billing.collection_interval,
        sweep_token.clone(),
    );

    info!("Orchestrator ready");
    shutdown_signal().await;

    sweep_token.cancel();
    orchestrator.shutdown().await;
    for (name, handle) in [("collector", collector), ("expiry sweep", sweeper)] {
        if let Err(e) = handle.await {
            warn!("Background task '{}' ended abnormally: {}", name, e);
        }
    }

    info!("Orchestrator stopped");
    Ok(())
}

async fn connect_repositories(manifest: &OrchestratorConfigManifest) -> Result<Repositories> {
    let backend = manifest
        .spec
        .storage
        .to_backend()
        .context("spec.storage.database_url is required for the postgres backend")?;

    match backend {
        StorageBackend::InMemory => {
            warn!("Using in-memory storage; state is lost on restart");
            Ok(Repositories::in_memory())
        }
        StorageBackend::PostgreSQL(config) => {
            let db = Database::new(&config.connection_string, config.max_connections).await?;
            db.migrate().await?;
            info!("Connected to PostgreSQL");
            Ok(Repositories::postgres(db.get_pool().clone()))
        }
    }
}

fn install_metrics_exporter(config: &MetricsConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid metrics listen address {}:{}",
                config.bind_address, config.port
            )
        })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Prometheus metrics exposed on http://{}/metrics", addr);
    Ok(())
}

/// Moves hirings past their `expires_at` to expired on every tick.
fn spawn_expiry_sweep(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match orchestrator.hirings.expire_hirings(Utc::now()).await {
                        Ok(0) => {}
                        Ok(count) => info!("Expired {} hiring(s)", count),
                        Err(e) => error!("Hiring expiry sweep failed: {}", e),
                    }
                }
            }
        }
    })
}

struct PidFileGuard;

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = remove_pid_file();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
