// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use aghub_orchestrator_core::application::hiring::CreatedHiring;
use aghub_orchestrator_core::application::orchestrator::Orchestrator;
use aghub_orchestrator_core::application::repository_factory::Repositories;
use aghub_orchestrator_core::domain::agent::{Agent, AgentId, ApprovalStatus, ExecutionModel};
use aghub_orchestrator_core::domain::deployment::{Deployment, DeploymentStatus};
use aghub_orchestrator_core::domain::endpoint::{AgentEndpointClient, ChatRequest, EndpointError, HealthProbe};
use aghub_orchestrator_core::domain::hiring::{NewHiring, UserId};
use aghub_orchestrator_core::domain::identity::Caller;
use aghub_orchestrator_core::domain::node_config::{OrchestratorConfigSpec, PortRange};
use aghub_orchestrator_core::domain::runtime::{
    BuildContext, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats, ExecOutput, RuntimeError,
};
use aghub_orchestrator_core::infrastructure::build_context::RESULT_MARKER;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// In-process stand-in for the Docker daemon. Failures are scripted by
/// substring of the container or image name.
#[derive(Default)]
pub struct FakeContainerRuntime {
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    pub images: Mutex<HashSet<String>>,
    pub builds: Mutex<Vec<(String, BuildContext)>>,
    pub execs: Mutex<Vec<(String, Vec<String>)>>,
    pub stats: Mutex<HashMap<String, ContainerStats>>,
    build_failure: Mutex<Option<String>>,
    stop_failures: Mutex<Vec<String>>,
    exec_reply: Mutex<Option<ExecOutput>>,
    exec_delay: Mutex<Duration>,
    build_delay: Mutex<Duration>,
    stats_delay: Mutex<Duration>,
    /// Removed containers stay visible to inspect.
    lingering: Mutex<bool>,
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_builds(&self, message: &str) {
        *self.build_failure.lock() = Some(message.to_string());
    }

    pub fn fail_stop_matching(&self, fragment: &str) {
        self.stop_failures.lock().push(fragment.to_string());
    }

    pub fn reply_to_exec(&self, output: ExecOutput) {
        *self.exec_reply.lock() = Some(output);
    }

    pub fn delay_exec(&self, delay: Duration) {
        *self.exec_delay.lock() = delay;
    }

    pub fn delay_builds(&self, delay: Duration) {
        *self.build_delay.lock() = delay;
    }

    pub fn delay_stats(&self, delay: Duration) {
        *self.stats_delay.lock() = delay;
    }

    pub fn keep_removed_containers(&self) {
        *self.lingering.lock() = true;
    }

    pub fn set_stats(&self, name: &str, stats: ContainerStats) {
        self.stats.lock().insert(name.to_string(), stats);
    }

    /// Simulates the process dying inside the container.
    pub fn crash(&self, name: &str, exit_code: i64) {
        if let Some(container) = self.containers.lock().get_mut(name) {
            container.running = false;
            container.exit_code = Some(exit_code);
        }
    }

    pub fn vanish(&self, name: &str) {
        self.containers.lock().remove(name);
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.containers.lock().get(name).map_or(false, |c| c.running)
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.containers.lock().get(name).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn build_image(
        &self,
        image: &str,
        context: BuildContext,
    ) -> Result<Vec<String>, RuntimeError> {
        self.builds.lock().push((image.to_string(), context));
        let delay = *self.build_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.build_failure.lock().clone() {
            return Err(RuntimeError::BuildFailed {
                message: message.clone(),
                logs: vec!["Step 1/4 : FROM python:3.11-slim".to_string(), message],
            });
        }
        self.images.lock().insert(image.to_string());
        Ok(vec![format!("Successfully tagged {}", image)])
    }

    async fn run_container(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
        if !self.images.lock().contains(&spec.image) {
            return Err(RuntimeError::StartFailed(format!("No such image: {}", spec.image)));
        }
        let mut containers = self.containers.lock();
        if containers.contains_key(&spec.name) {
            return Err(RuntimeError::StartFailed(format!("Conflict: name {} in use", spec.name)));
        }
        let id = format!("cid-{}", spec.name);
        containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec,
                running: true,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn stop_container(&self, name: &str, _grace: Duration) -> Result<(), RuntimeError> {
        if self.stop_failures.lock().iter().any(|f| name.contains(f.as_str())) {
            return Err(RuntimeError::StopFailed(format!("{}: device or resource busy", name)));
        }
        match self.containers.lock().get_mut(name) {
            Some(container) => {
                container.running = false;
                container.exit_code.get_or_insert(0);
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(name.to_string())),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        if *self.lingering.lock() {
            return Ok(());
        }
        match self.containers.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::ContainerNotFound(name.to_string())),
        }
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        Ok(self.containers.lock().get(name).map(|c| ContainerState {
            id: format!("cid-{}", name),
            running: c.running,
            status: if c.running { "running" } else { "exited" }.to_string(),
            exit_code: c.exit_code,
        }))
    }

    async fn stats(&self, name: &str) -> Result<ContainerStats, RuntimeError> {
        let delay = *self.stats_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.containers.lock().contains_key(name) {
            return Err(RuntimeError::ContainerNotFound(name.to_string()));
        }
        Ok(self.stats.lock().get(name).cloned().unwrap_or_default())
    }

    async fn exec(&self, name: &str, cmd: Vec<String>) -> Result<ExecOutput, RuntimeError> {
        if !self.is_running(name) {
            return Err(RuntimeError::ContainerNotFound(name.to_string()));
        }
        self.execs.lock().push((name.to_string(), cmd.clone()));
        let delay = *self.exec_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reply) = self.exec_reply.lock().clone() {
            return Ok(reply);
        }
        // Echo the input back the way the function runner reports results.
        let input = cmd.get(2).cloned().unwrap_or_else(|| "null".to_string());
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("starting\n{}{{\"echo\":{}}}\n", RESULT_MARKER, input),
            stderr: String::new(),
        })
    }

    async fn logs(&self, name: &str, _tail: usize) -> Result<Vec<String>, RuntimeError> {
        Ok(vec![format!("{}: Traceback (most recent call last)", name)])
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.images.lock().remove(image);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum ChatReply {
    Echo,
    Json(Value),
    Timeout,
    Status(u16),
}

/// Agent HTTP surface with a scripted answer.
pub struct FakeAgentEndpoint {
    pub requests: Mutex<Vec<(String, ChatRequest)>>,
    health: Mutex<HealthProbe>,
    reply: Mutex<ChatReply>,
}

impl Default for FakeAgentEndpoint {
    fn default() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            health: Mutex::new(HealthProbe::Healthy),
            reply: Mutex::new(ChatReply::Echo),
        }
    }
}

impl FakeAgentEndpoint {
    pub fn set_health(&self, probe: HealthProbe) {
        *self.health.lock() = probe;
    }

    pub fn set_reply(&self, reply: ChatReply) {
        *self.reply.lock() = reply;
    }
}

#[async_trait]
impl AgentEndpointClient for FakeAgentEndpoint {
    async fn health(&self, _base_url: &str, _timeout: Duration) -> HealthProbe {
        self.health.lock().clone()
    }

    async fn chat(
        &self,
        base_url: &str,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<Value, EndpointError> {
        self.requests.lock().push((base_url.to_string(), request.clone()));
        let reply = self.reply.lock().clone();
        match reply {
            ChatReply::Echo => Ok(json!({ "response": format!("echo: {}", request.message) })),
            ChatReply::Json(value) => Ok(value),
            ChatReply::Timeout => Err(EndpointError::Timeout(timeout)),
            ChatReply::Status(status) => Err(EndpointError::Status {
                status,
                body: "internal error".to_string(),
            }),
        }
    }
}

pub fn test_spec() -> OrchestratorConfigSpec {
    let mut spec = OrchestratorConfigSpec::default();
    spec.runtime.external_port_range = PortRange {
        start: 21000,
        end: 21009,
    };
    spec.runtime.stop_timeout = Duration::from_millis(200);
    spec.runtime.removal_poll_interval = Duration::from_millis(10);
    spec.runtime.stop_grace = Duration::from_millis(10);
    spec.execution.request_timeout = Duration::from_secs(2);
    spec.execution.exec_timeout = Duration::from_secs(2);
    spec
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub runtime: Arc<FakeContainerRuntime>,
    pub endpoint: Arc<FakeAgentEndpoint>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_spec(test_spec())
    }

    pub fn with_spec(spec: OrchestratorConfigSpec) -> Self {
        let runtime = Arc::new(FakeContainerRuntime::new());
        let endpoint = Arc::new(FakeAgentEndpoint::default());
        let orchestrator = Orchestrator::new(&spec, Repositories::in_memory(), runtime.clone(), endpoint.clone());
        Self {
            orchestrator,
            runtime,
            endpoint,
        }
    }

    pub async fn seed_agent(&self, id: &str, model: ExecutionModel, creator: i64) -> Agent {
        let mut agent = Agent::new(AgentId::new(id), UserId(creator), model, "main.py");
        agent.approval_status = ApprovalStatus::Approved;
        agent
            .files
            .insert("main.py".to_string(), "def run(x):\n    return x\n".to_string());
        self.orchestrator
            .repositories
            .agents
            .save(&agent)
            .await
            .expect("agent saved");
        agent
    }

    pub async fn hire(&self, user: i64, agent: &str) -> CreatedHiring {
        self.orchestrator
            .hirings
            .create_hiring(&Caller::user(user), NewHiring::new(UserId(user), AgentId::new(agent)))
            .await
            .expect("hiring created")
    }

    /// Hires and waits for the background build to settle.
    pub async fn hire_running(&self, user: i64, agent: &str) -> (CreatedHiring, Deployment) {
        let created = self.hire(user, agent).await;
        let deployment = self
            .orchestrator
            .deployments
            .wait_for_deployment(&created.deployment.id, Duration::from_secs(5))
            .await
            .expect("deployment settled");
        assert_eq!(deployment.status, DeploymentStatus::Running, "error: {:?}", deployment.error_message);
        (created, deployment)
    }
}
