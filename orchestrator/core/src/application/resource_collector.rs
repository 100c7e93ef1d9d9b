// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resource Usage Collector
//!
//! Polls every `running` deployment on a fixed interval, turns the runtime's
//! cumulative counters into a [`ResourceSnapshot`] priced at the current rate
//! card and hands it to the [`BillingService`]. A deployment whose container
//! has vanished is reconciled through the [`DeploymentManager`] instead.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::gauge;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::billing::BillingService;
use crate::application::deployment_manager::DeploymentManager;
use crate::domain::billing::{counter_delta, cpu_percent, MetricAccuracy, ResourceSnapshot, SnapshotMetrics};
use crate::domain::deployment::{Deployment, DeploymentId, DeploymentStatus};
use crate::domain::error::OrchestrationError;
use crate::domain::repository::DeploymentRepository;

/// Stats reads in flight at once. Docker takes about a second per read.
const MAX_CONCURRENT_READS: usize = 16;

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub collected: usize,
    pub crashed: usize,
    pub skipped: usize,
}

pub struct ResourceUsageCollector {
    deployments: Arc<dyn DeploymentRepository>,
    manager: Arc<DeploymentManager>,
    billing: Arc<BillingService>,
    interval: Duration,
    /// Last cumulative network byte count per deployment.
    network_totals: Mutex<HashMap<DeploymentId, u64>>,
}

impl ResourceUsageCollector {
    pub fn new(
        deployments: Arc<dyn DeploymentRepository>,
        manager: Arc<DeploymentManager>,
        billing: Arc<BillingService>,
        interval: Duration,
    ) -> Self {
        Self {
            deployments,
            manager,
            billing,
            interval,
            network_totals: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Measures one deployment. `Ok(None)` means it crashed and was reconciled.
    pub async fn collect_deployment(
        &self,
        deployment: &Deployment,
        now: DateTime<Utc>,
    ) -> Result<Option<ResourceSnapshot>, OrchestrationError> {
        let runtime = self.manager.runtime();
        let stats = match runtime.stats(&deployment.container_name).await {
            Ok(stats) => stats,
            Err(e) if e.is_not_found() => {
                self.network_totals.lock().remove(&deployment.id);
                let reconciled = self.manager.reconcile(deployment.clone()).await?;
                debug!(deployment_id = %deployment.id, status = %reconciled.status, "Stats target missing");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let (cpu, accuracy) = cpu_percent(&stats, self.interval);
        if accuracy == MetricAccuracy::Estimated {
            warn!(
                deployment_id = %deployment.id,
                "Host CPU counter unavailable, CPU usage estimated from container delta"
            );
        }

        let network_total = stats.network_total_bytes();
        let previous = self
            .network_totals
            .lock()
            .insert(deployment.id.clone(), network_total);

        let metrics = SnapshotMetrics {
            cpu_percent: cpu,
            memory_bytes: stats.memory_usage_bytes,
            network_bytes: counter_delta(previous, network_total),
            block_read_bytes: stats.block_read_bytes,
            block_write_bytes: stats.block_write_bytes,
            storage_bytes: stats.storage_bytes.unwrap_or(0),
        };
        let snapshot = ResourceSnapshot::new(
            deployment.id.clone(),
            deployment.hiring_id,
            deployment.user_id,
            now,
            self.interval,
            metrics,
            accuracy,
            self.billing.rates(),
        );
        self.billing.record_snapshot(&snapshot).await?;
        Ok(Some(snapshot))
    }

    /// One pass over every running deployment, read concurrently. Failures
    /// are isolated per deployment.
    pub async fn collect_once(
        &self,
        now: DateTime<Utc>,
    ) -> Result<CollectionReport, OrchestrationError> {
        let running = self.deployments.list_by_status(DeploymentStatus::Running).await?;
        gauge!("aghub_running_deployments").set(running.len() as f64);

        let reads: Vec<_> = running
            .iter()
            .map(|deployment| async move { (deployment, self.collect_deployment(deployment, now).await) })
            .collect();
        let outcomes: Vec<_> = stream::iter(reads)
            .buffer_unordered(MAX_CONCURRENT_READS)
            .collect()
            .await;

        let mut report = CollectionReport::default();
        for (deployment, outcome) in outcomes {
            match outcome {
                Ok(Some(snapshot)) => {
                    report.collected += 1;
                    debug!(
                        deployment_id = %deployment.id,
                        cost = snapshot.total_cost(),
                        cpu_percent = snapshot.metrics.cpu_percent,
                        "Snapshot recorded"
                    );
                }
                Ok(None) => report.crashed += 1,
                Err(e) => {
                    report.skipped += 1;
                    warn!(deployment_id = %deployment.id, "Snapshot collection failed: {}", e);
                }
            }
        }

        // Forget counters of deployments that stopped running.
        self.network_totals
            .lock()
            .retain(|id, _| running.iter().any(|d| &d.id == id));
        Ok(report)
    }

    /// Runs `collect_once` every interval until `shutdown` fires.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(interval = ?self.interval, "Starting resource usage collector");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut passes = 0u64;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                passes += 1;
                match self.collect_once(Utc::now()).await {
                    Ok(report) if report.crashed > 0 || report.skipped > 0 => {
                        info!(
                            collected = report.collected,
                            crashed = report.crashed,
                            skipped = report.skipped,
                            "Collection pass finished with issues"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("Collection pass {} failed: {}", passes, e),
                }
            }

            info!("Resource usage collector shut down after {} passes", passes);
        })
    }
}
