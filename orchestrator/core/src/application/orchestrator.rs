// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Orchestrator
//!
//! Composition root: builds every application service from one config spec,
//! a set of repositories and the two outbound ports (container runtime and
//! agent endpoint client). The daemon and the integration tests both go
//! through here so they share the exact same wiring.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::application::billing::BillingService;
use crate::application::deployment_manager::{DeploymentManager, DeploymentSettings};
use crate::application::execution::{ExecutionService, ExecutionSettings};
use crate::application::hiring::HiringCoordinator;
use crate::application::repository_factory::Repositories;
use crate::application::resource_collector::ResourceUsageCollector;
use crate::application::usage_tracker::UsageTracker;
use crate::domain::endpoint::AgentEndpointClient;
use crate::domain::node_config::OrchestratorConfigSpec;
use crate::domain::runtime::ContainerRuntime;
use crate::infrastructure::event_bus::EventBus;

pub struct Orchestrator {
    pub repositories: Repositories,
    pub event_bus: Arc<EventBus>,
    pub deployments: Arc<DeploymentManager>,
    pub executions: Arc<ExecutionService>,
    pub hirings: Arc<HiringCoordinator>,
    pub billing: Arc<BillingService>,
    pub usage: Arc<UsageTracker>,
    pub collector: Arc<ResourceUsageCollector>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        spec: &OrchestratorConfigSpec,
        repositories: Repositories,
        runtime: Arc<dyn ContainerRuntime>,
        endpoint: Arc<dyn AgentEndpointClient>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::with_default_capacity());

        let deployments = Arc::new(DeploymentManager::new(
            repositories.agents.clone(),
            repositories.deployments.clone(),
            runtime,
            endpoint.clone(),
            event_bus.clone(),
            DeploymentSettings::from_config(spec),
        ));

        let billing = Arc::new(BillingService::new(
            repositories.usage.clone(),
            repositories.hirings.clone(),
            spec.billing.rates,
            spec.billing.default_monthly_budget,
        ));

        let usage = Arc::new(UsageTracker::new(repositories.usage.clone()));

        let executions = Arc::new(
            ExecutionService::new(
                repositories.agents.clone(),
                repositories.hirings.clone(),
                repositories.executions.clone(),
                deployments.clone(),
                endpoint,
                usage.clone(),
                event_bus.clone(),
                ExecutionSettings::from_config(&spec.execution),
            )
            .with_budget_guard(billing.clone()),
        );

        let hirings = Arc::new(HiringCoordinator::new(
            repositories.agents.clone(),
            repositories.hirings.clone(),
            deployments.clone(),
            executions.clone(),
            event_bus.clone(),
            spec.runtime.stop_timeout,
        ));

        let collector = Arc::new(ResourceUsageCollector::new(
            repositories.deployments.clone(),
            deployments.clone(),
            billing.clone(),
            spec.billing.collection_interval,
        ));

        Self {
            repositories,
            event_bus,
            deployments,
            executions,
            hirings,
            billing,
            usage,
            collector,
            shutdown: CancellationToken::new(),
        }
    }

    /// Starts the periodic resource collector; it stops with [`Self::shutdown`].
    pub fn start_background_tasks(&self) -> JoinHandle<()> {
        self.collector.clone().start(self.shutdown.child_token())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.shutdown.cancel();
        self.executions.shutdown();
        self.deployments.shutdown().await;
    }
}
