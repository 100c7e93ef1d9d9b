// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Deployment Manager
//!
//! Owns the container lifecycle of every deployment: creation with port
//! allocation, image build, container start, health probing, stop, restart and
//! cancellation teardown. It is the only writer of deployment records.
//!
//! Build and teardown are long-running; callers that must not block use
//! [`DeploymentManager::start_build`], which queues the job on the
//! [`DeploymentWorkers`] registry and returns the transitional record.

use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::deployment_workers::DeploymentWorkers;
use crate::application::port_allocator::PortAllocator;
use crate::domain::agent::Agent;
use crate::domain::deployment::{Deployment, DeploymentFlavor, DeploymentId, DeploymentStatus};
use crate::domain::endpoint::AgentEndpointClient;
use crate::domain::error::OrchestrationError;
use crate::domain::events::DeploymentEvent;
use crate::domain::hiring::{Hiring, HiringId, UserId};
use crate::domain::node_config::{OrchestratorConfigSpec, PortRange};
use crate::domain::repository::{AgentRepository, DeploymentRepository};
use crate::domain::runtime::{ContainerRuntime, ContainerSpec, PortMapping, RuntimeError};
use crate::infrastructure::build_context;
use crate::infrastructure::event_bus::EventBus;

/// Runtime knobs the manager needs, lifted out of the config manifest.
#[derive(Debug, Clone)]
pub struct DeploymentSettings {
    pub base_image: String,
    pub internal_port: u16,
    pub external_port_range: PortRange,
    pub endpoint_host: String,
    pub cpu_millis: Option<u32>,
    pub memory_limit_bytes: Option<u64>,
    pub stop_timeout: Duration,
    pub stop_grace: Duration,
    pub removal_poll_interval: Duration,
    pub log_tail: usize,
    pub probe_timeout: Duration,
}

impl DeploymentSettings {
    pub fn from_config(spec: &OrchestratorConfigSpec) -> Self {
        let runtime = &spec.runtime;
        Self {
            base_image: runtime.base_image.clone(),
            internal_port: runtime.internal_port,
            external_port_range: runtime.external_port_range,
            endpoint_host: runtime.endpoint_host.clone(),
            cpu_millis: runtime.cpu_millis,
            memory_limit_bytes: runtime.memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
            stop_timeout: runtime.stop_timeout,
            stop_grace: runtime.stop_grace,
            removal_poll_interval: runtime.removal_poll_interval,
            log_tail: runtime.log_tail,
            probe_timeout: spec.health.probe_timeout,
        }
    }
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfigSpec::default())
    }
}

/// Result of a stop or cancel. `fully_cleaned` is false when the container
/// was still present after the removal poll gave up.
#[derive(Debug, Clone)]
pub struct Teardown {
    pub deployment: Deployment,
    pub fully_cleaned: bool,
}

pub struct DeploymentManager {
    agents: Arc<dyn AgentRepository>,
    deployments: Arc<dyn DeploymentRepository>,
    runtime: Arc<dyn ContainerRuntime>,
    endpoint: Arc<dyn AgentEndpointClient>,
    ports: PortAllocator,
    workers: DeploymentWorkers,
    event_bus: Arc<EventBus>,
    settings: DeploymentSettings,
}

impl DeploymentManager {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        deployments: Arc<dyn DeploymentRepository>,
        runtime: Arc<dyn ContainerRuntime>,
        endpoint: Arc<dyn AgentEndpointClient>,
        event_bus: Arc<EventBus>,
        settings: DeploymentSettings,
    ) -> Self {
        let ports = PortAllocator::new(settings.external_port_range, deployments.clone());
        Self {
            agents,
            deployments,
            runtime,
            endpoint,
            ports,
            workers: DeploymentWorkers::new(),
            event_bus,
            settings,
        }
    }

    pub fn settings(&self) -> &DeploymentSettings {
        &self.settings
    }

    pub fn workers(&self) -> &DeploymentWorkers {
        &self.workers
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// `http://{endpoint_host}:{external_port}` for networked deployments.
    pub fn endpoint_url(&self, deployment: &Deployment) -> Option<String> {
        deployment
            .external_port
            .filter(|_| deployment.is_networked())
            .map(|port| format!("http://{}:{}", self.settings.endpoint_host, port))
    }

    pub async fn get(&self, id: &DeploymentId) -> Result<Deployment, OrchestrationError> {
        self.deployments
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("Deployment", id))
    }

    pub async fn find_for_hiring(
        &self,
        hiring_id: HiringId,
    ) -> Result<Option<Deployment>, OrchestrationError> {
        Ok(self.deployments.find_by_hiring(hiring_id).await?)
    }

    /// Persists a `pending` deployment for `hiring`, allocating an external
    /// port for networked models.
    pub async fn create_deployment(
        &self,
        hiring: &Hiring,
        agent: &Agent,
    ) -> Result<Deployment, OrchestrationError> {
        let model = agent.execution_model;
        let deployment = if model.flavor() == DeploymentFlavor::Networked {
            let lease = self.ports.reserve(None).await?;
            let deployment = Deployment::new(
                hiring.id,
                hiring.user_id,
                agent.id.clone(),
                model,
                Some(self.settings.internal_port),
                Some(lease.port()),
            );
            self.deployments.save(&deployment).await?;
            drop(lease);
            deployment
        } else {
            let deployment = Deployment::new(hiring.id, hiring.user_id, agent.id.clone(), model, None, None);
            self.deployments.save(&deployment).await?;
            deployment
        };

        info!(
            deployment_id = %deployment.id,
            hiring_id = %hiring.id,
            model = %model,
            external_port = ?deployment.external_port,
            "Deployment created"
        );
        counter!("aghub_deployments_total", "status" => DeploymentStatus::Pending.as_str()).increment(1);
        self.event_bus.publish_deployment_event(DeploymentEvent::DeploymentCreated {
            deployment_id: deployment.id.clone(),
            hiring_id: deployment.hiring_id,
            external_port: deployment.external_port,
            created_at: deployment.created_at,
        });
        Ok(deployment)
    }

    async fn persist_transition(
        &self,
        deployment: &Deployment,
        from: DeploymentStatus,
    ) -> Result<(), OrchestrationError> {
        self.deployments.save(deployment).await?;
        self.announce_transition(deployment, from);
        Ok(())
    }

    /// Like [`persist_transition`](Self::persist_transition), but only lands if
    /// the stored status is still `from`. A stop or cancel that raced a build
    /// wins; the build sees `Validation` and backs off.
    async fn persist_build_step(
        &self,
        deployment: &Deployment,
        from: DeploymentStatus,
    ) -> Result<(), OrchestrationError> {
        if !self.deployments.transition(deployment, from).await? {
            warn!(
                deployment_id = %deployment.id,
                expected = %from,
                "Deployment changed state during build, abandoning"
            );
            return Err(OrchestrationError::Validation(format!(
                "deployment {} left {} while building",
                deployment.id, from
            )));
        }
        self.announce_transition(deployment, from);
        Ok(())
    }

    fn announce_transition(&self, deployment: &Deployment, from: DeploymentStatus) {
        if from != deployment.status {
            counter!("aghub_deployments_total", "status" => deployment.status.as_str()).increment(1);
            self.event_bus.publish_deployment_event(DeploymentEvent::DeploymentStatusChanged {
                deployment_id: deployment.id.clone(),
                hiring_id: deployment.hiring_id,
                from,
                to: deployment.status,
                error: deployment.error_message.clone(),
                changed_at: deployment.updated_at,
            });
        }
    }

    async fn record_failure(
        &self,
        deployment: &mut Deployment,
        error: &RuntimeError,
    ) -> Result<(), OrchestrationError> {
        let from = deployment.status;
        let mut logs = error.logs();
        if logs.is_empty() && deployment.container_id.is_some() {
            logs = self
                .runtime
                .logs(&deployment.container_name, self.settings.log_tail)
                .await
                .unwrap_or_default();
        }
        deployment.mark_failed(error.to_string(), logs);
        error!(deployment_id = %deployment.id, from = %from, "Deployment failed: {}", error);
        self.persist_build_step(deployment, from).await
    }

    /// Builds the image and starts the container:
    /// `building → deploying → running`. A failure at any stage is recorded as
    /// `failed` with the error and captured logs, then returned.
    pub async fn build_and_deploy(
        &self,
        id: &DeploymentId,
    ) -> Result<Deployment, OrchestrationError> {
        let mut deployment = self.get(id).await?;
        let agent = self
            .agents
            .find_by_id(&deployment.agent_id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("Agent", &deployment.agent_id))?;

        let from = deployment.status;
        deployment
            .begin_build()
            .map_err(|e| OrchestrationError::Validation(e.to_string()))?;

        // A terminal deployment released its port; someone may have taken it since.
        if deployment.is_networked() && from.is_terminal() {
            let lease = self.ports.reserve(deployment.external_port).await?;
            if deployment.external_port != Some(lease.port()) {
                info!(
                    deployment_id = %deployment.id,
                    previous = ?deployment.external_port,
                    port = lease.port(),
                    "External port re-allocated"
                );
            }
            deployment.external_port = Some(lease.port());
            deployment.internal_port.get_or_insert(self.settings.internal_port);
            self.persist_build_step(&deployment, from).await?;
            drop(lease);
        } else {
            self.persist_build_step(&deployment, from).await?;
        }

        let context =
            build_context::materialize(&agent, &self.settings.base_image, self.settings.internal_port);
        info!(deployment_id = %deployment.id, image = %deployment.image_name, "Building deployment image");
        if let Err(e) = self.runtime.build_image(&deployment.image_name, context).await {
            self.record_failure(&mut deployment, &e).await?;
            return Err(e.into());
        }

        let from = deployment.status;
        deployment
            .begin_deploy()
            .map_err(|e| OrchestrationError::Validation(e.to_string()))?;
        self.persist_build_step(&deployment, from).await?;

        // A crashed or stopped predecessor may still hold the name.
        match self.runtime.remove_container(&deployment.container_name).await {
            Ok(()) => debug!(container = %deployment.container_name, "Removed leftover container"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(container = %deployment.container_name, "Leftover container not removed: {}", e),
        }

        let spec = self.container_spec(&deployment, &agent);
        let container_id = match self.runtime.run_container(spec).await {
            Ok(container_id) => container_id,
            Err(e) => {
                self.record_failure(&mut deployment, &e).await?;
                return Err(e.into());
            }
        };

        let from = deployment.status;
        deployment
            .mark_running(container_id)
            .map_err(|e| OrchestrationError::Validation(e.to_string()))?;
        if let Err(e) = self.persist_build_step(&deployment, from).await {
            // Stopped while the container was starting; do not leave it behind.
            if let Err(cleanup) = self
                .teardown_container(&deployment, self.settings.stop_timeout)
                .await
            {
                warn!(deployment_id = %deployment.id, "Orphaned container not removed: {}", cleanup);
            }
            return Err(e);
        }
        info!(
            deployment_id = %deployment.id,
            container = %deployment.container_name,
            "Deployment running"
        );
        Ok(deployment)
    }

    fn container_spec(&self, deployment: &Deployment, agent: &Agent) -> ContainerSpec {
        let mut env = vec![
            ("AGHUB_DEPLOYMENT_ID".to_string(), deployment.id.to_string()),
            ("AGHUB_AGENT_ID".to_string(), deployment.agent_id.to_string()),
            ("AGHUB_HIRING_ID".to_string(), deployment.hiring_id.to_string()),
            ("AGHUB_USER_ID".to_string(), deployment.user_id.to_string()),
            ("AGHUB_EXECUTION_MODEL".to_string(), agent.execution_model.to_string()),
        ];
        let port = match (deployment.internal_port, deployment.external_port) {
            (Some(internal), Some(external)) if deployment.is_networked() => {
                env.push(("PORT".to_string(), internal.to_string()));
                Some(PortMapping { internal, external })
            }
            _ => None,
        };
        let labels = [
            ("aghub.deployment_id", deployment.id.to_string()),
            ("aghub.hiring_id", deployment.hiring_id.to_string()),
            ("aghub.user_id", deployment.user_id.to_string()),
            ("aghub.agent_id", deployment.agent_id.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        ContainerSpec {
            name: deployment.container_name.clone(),
            image: deployment.image_name.clone(),
            env,
            labels,
            port,
            command: None,
            memory_limit_bytes: self.settings.memory_limit_bytes,
            cpu_millis: self.settings.cpu_millis,
        }
    }

    /// Queues `build_and_deploy` on the worker registry and returns at once.
    pub fn start_build(self: &Arc<Self>, id: DeploymentId) {
        let manager = Arc::clone(self);
        let job_id = id.clone();
        self.workers.spawn(id, async move {
            if let Err(e) = manager.build_and_deploy(&job_id).await {
                warn!(deployment_id = %job_id, "Background build ended with error: {}", e);
            }
        });
    }

    /// Rebuilds a stopped, failed or crashed deployment in the background.
    /// Deployments already running or in flight are left alone.
    pub async fn resume(
        self: &Arc<Self>,
        id: &DeploymentId,
    ) -> Result<Deployment, OrchestrationError> {
        let deployment = self.get(id).await?;
        if deployment.status.is_resumable() && !self.workers.is_busy(id) {
            info!(deployment_id = %id, status = %deployment.status, "Resuming deployment");
            self.start_build(id.clone());
        }
        Ok(deployment)
    }

    /// Stops and removes the container, then waits up to `timeout` for the
    /// runtime to report it gone. An already absent container is success; a
    /// poll that runs out only logs a warning.
    async fn teardown_container(
        &self,
        deployment: &Deployment,
        timeout: Duration,
    ) -> Result<bool, OrchestrationError> {
        let name = &deployment.container_name;
        match self.runtime.stop_container(name, self.settings.stop_grace).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(container = %name, "Container already absent"),
            Err(e) => return Err(e.into()),
        }
        match self.runtime.remove_container(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.runtime.inspect_container(name).await {
                Ok(None) => return Ok(true),
                Ok(Some(_)) => {}
                Err(e) => debug!(container = %name, "Inspect during removal poll failed: {}", e),
            }
            if Instant::now() >= deadline {
                warn!(
                    deployment_id = %deployment.id,
                    container = %name,
                    timeout = ?timeout,
                    "Container still present after removal poll"
                );
                return Ok(false);
            }
            tokio::time::sleep(self.settings.removal_poll_interval).await;
        }
    }

    /// Stops and removes the container and marks the deployment `stopped`.
    /// A build still in flight for it is cancelled first.
    pub async fn stop_deployment(
        &self,
        id: &DeploymentId,
        timeout: Option<Duration>,
    ) -> Result<Teardown, OrchestrationError> {
        self.workers.cancel(id).await;
        let mut deployment = self.get(id).await?;
        let fully_cleaned = self
            .teardown_container(&deployment, timeout.unwrap_or(self.settings.stop_timeout))
            .await?;

        let from = deployment.status;
        if from != DeploymentStatus::Cancelled {
            deployment.mark_stopped();
        }
        self.persist_transition(&deployment, from).await?;
        info!(deployment_id = %id, fully_cleaned, "Deployment stopped");
        Ok(Teardown {
            deployment,
            fully_cleaned,
        })
    }

    /// Full rebuild: stop, then build and deploy again. Container state is not
    /// carried over.
    pub async fn restart_deployment(
        &self,
        id: &DeploymentId,
    ) -> Result<Deployment, OrchestrationError> {
        self.stop_deployment(id, None).await?;
        self.build_and_deploy(id).await
    }

    /// Tears the deployment down for good: stop and remove the container,
    /// mark `cancelled`, remove the image. Re-running it on a cancelled
    /// deployment repeats the cleanup.
    pub async fn cancel_deployment(
        &self,
        id: &DeploymentId,
        timeout: Option<Duration>,
    ) -> Result<Teardown, OrchestrationError> {
        self.workers.cancel(id).await;
        let mut deployment = self.get(id).await?;
        let fully_cleaned = self
            .teardown_container(&deployment, timeout.unwrap_or(self.settings.stop_timeout))
            .await?;

        let from = deployment.status;
        deployment.mark_cancelled();
        self.persist_transition(&deployment, from).await?;

        if let Err(e) = self.runtime.remove_image(&deployment.image_name).await {
            warn!(deployment_id = %id, image = %deployment.image_name, "Image removal failed: {}", e);
        }
        info!(deployment_id = %id, fully_cleaned, "Deployment cancelled");
        Ok(Teardown {
            deployment,
            fully_cleaned,
        })
    }

    /// Current record, reconciled against the runtime. A `running` deployment
    /// whose container is gone or exited becomes `crashed`; a live networked
    /// one is health-probed.
    pub async fn get_status(&self, id: &DeploymentId) -> Result<Deployment, OrchestrationError> {
        let deployment = self.reconcile(self.get(id).await?).await?;
        if deployment.is_running() && deployment.is_networked() {
            self.health_check(id).await?;
            return self.get(id).await;
        }
        Ok(deployment)
    }

    pub(crate) async fn reconcile(
        &self,
        mut deployment: Deployment,
    ) -> Result<Deployment, OrchestrationError> {
        if !deployment.is_running() {
            return Ok(deployment);
        }
        let reason = match self.runtime.inspect_container(&deployment.container_name).await {
            Ok(Some(state)) if state.running => return Ok(deployment),
            Ok(Some(state)) => format!(
                "Container exited ({}) with code {}",
                state.status,
                state.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
            ),
            Ok(None) => "Container no longer exists".to_string(),
            Err(e) => {
                debug!(deployment_id = %deployment.id, "Reconcile skipped, inspect failed: {}", e);
                return Ok(deployment);
            }
        };

        let from = deployment.status;
        deployment.logs = self
            .runtime
            .logs(&deployment.container_name, self.settings.log_tail)
            .await
            .unwrap_or_default();
        deployment.mark_crashed(reason.clone());
        if !self.deployments.transition(&deployment, from).await? {
            // Stopped or cancelled while we looked; that write stands.
            return self.get(&deployment.id).await;
        }
        warn!(deployment_id = %deployment.id, "Deployment crashed: {}", reason);
        self.announce_transition(&deployment, from);
        Ok(deployment)
    }

    /// Probes `/health`. Only an explicit answer updates the record; transport
    /// noise returns `None` and leaves it untouched.
    pub async fn health_check(
        &self,
        id: &DeploymentId,
    ) -> Result<Option<bool>, OrchestrationError> {
        let mut deployment = self.get(id).await?;
        if !deployment.is_running() {
            return Ok(None);
        }
        let Some(url) = self.endpoint_url(&deployment) else {
            return Ok(None);
        };

        let probe = self.endpoint.health(&url, self.settings.probe_timeout).await;
        let Some(healthy) = probe.verdict() else {
            debug!(deployment_id = %id, probe = ?probe, "Health probe inconclusive");
            return Ok(None);
        };

        let was_healthy = deployment.is_healthy;
        deployment.record_health(healthy);
        if !self.deployments.transition(&deployment, DeploymentStatus::Running).await? {
            debug!(deployment_id = %id, "Deployment left running during health probe");
            return Ok(None);
        }
        if was_healthy != healthy {
            info!(deployment_id = %id, healthy, "Deployment health changed");
            self.event_bus.publish_deployment_event(DeploymentEvent::HealthChanged {
                deployment_id: deployment.id.clone(),
                healthy,
                consecutive_failures: deployment.health_check_failures,
                checked_at: Utc::now(),
            });
        }
        Ok(Some(healthy))
    }

    pub async fn list_deployments(
        &self,
        user_id: Option<UserId>,
        status: Option<DeploymentStatus>,
    ) -> Result<Vec<Deployment>, OrchestrationError> {
        let mut deployments = match (user_id, status) {
            (Some(user), _) => self.deployments.list_by_user(user).await?,
            (None, Some(status)) => self.deployments.list_by_status(status).await?,
            (None, None) => self.deployments.list_all().await?,
        };
        if let Some(status) = status {
            deployments.retain(|d| d.status == status);
        }
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }

    /// Resolves once the deployment is `running` or terminal, or returns the
    /// current record when `timeout` elapses first.
    pub async fn wait_for_deployment(
        &self,
        id: &DeploymentId,
        timeout: Duration,
    ) -> Result<Deployment, OrchestrationError> {
        let mut events = self.event_bus.subscribe_deployment(id.clone());
        let deployment = self.get(id).await?;
        if settled(deployment.status) {
            return Ok(deployment);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(DeploymentEvent::DeploymentStatusChanged { to, .. })) if settled(to) => break,
                Ok(Ok(_)) => {}
                // Lagged or closed: fall back to the store.
                Ok(Err(_)) => {
                    if settled(self.get(id).await?.status) {
                        break;
                    }
                    tokio::time::sleep(
                        self.settings
                            .removal_poll_interval
                            .min(deadline.saturating_duration_since(Instant::now())),
                    )
                    .await;
                }
                Err(_) => break,
            }
        }
        self.get(id).await
    }

    /// Cancels queued work and waits for in-flight jobs to unwind.
    pub async fn shutdown(&self) {
        self.workers.shutdown().await;
    }
}

fn settled(status: DeploymentStatus) -> bool {
    status == DeploymentStatus::Running || status.is_terminal()
}
