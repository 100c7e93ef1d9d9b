// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Execution Service
//!
//! Accepts invocations against a hiring and dispatches them into the hiring's
//! deployment according to the agent's execution model:
//!
//! - `function`: one-shot exec of the runner shim inside the idle container;
//! - `acp_server`, `persistent`: `POST /chat` on the deployment endpoint.
//!
//! Every dispatch happens inside a container. When the hiring has no running
//! deployment the run fails under [`MissingDeploymentPolicy::HardFail`]; there
//! is no in-process fallback.
//!
//! Input is validated against the agent's input schema before anything is
//! persisted. Output schema violations are only logged.

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::billing::BillingService;
use crate::application::deployment_manager::DeploymentManager;
use crate::application::usage_tracker::UsageTracker;
use crate::domain::agent::{Agent, ExecutionModel};
use crate::domain::billing::{UsageOperation, UsageSummary};
use crate::domain::deployment::Deployment;
use crate::domain::endpoint::{AgentEndpointClient, ChatRequest, EndpointError};
use crate::domain::error::OrchestrationError;
use crate::domain::events::ExecutionEvent;
use crate::domain::execution::{Execution, ExecutionError, ExecutionId, ExecutionStatus, ExecutionType};
use crate::domain::hiring::{Hiring, HiringId, HiringStatus};
use crate::domain::identity::{Caller, Capability};
use crate::domain::node_config::ExecutionConfig;
use crate::domain::repository::{AgentRepository, ExecutionRepository, HiringRepository};
use crate::domain::validation::validate_optional;
use crate::infrastructure::build_context::{FUNCTION_RUNNER_PATH, RESULT_MARKER};
use crate::infrastructure::event_bus::EventBus;

/// What to do when a run finds no running deployment for its hiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingDeploymentPolicy {
    /// Fail the execution with `no deployment found`.
    #[default]
    HardFail,
}

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub request_timeout: Duration,
    pub exec_timeout: Duration,
    pub missing_deployment: MissingDeploymentPolicy,
}

impl ExecutionSettings {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            exec_timeout: config.exec_timeout,
            missing_deployment: MissingDeploymentPolicy::HardFail,
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

/// A finished (or, after a wait timeout, still running) execution with its
/// usage summary.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution: Execution,
    pub usage: UsageSummary,
}

enum DispatchOutcome {
    Completed(Value),
    Failed { error: String, logs: Vec<String> },
    TimedOut(String),
    Cancelled,
}

impl DispatchOutcome {
    fn failed(error: impl Into<String>) -> Self {
        DispatchOutcome::Failed {
            error: error.into(),
            logs: Vec::new(),
        }
    }
}

pub struct ExecutionService {
    agents: Arc<dyn AgentRepository>,
    hirings: Arc<dyn HiringRepository>,
    executions: Arc<dyn ExecutionRepository>,
    deployments: Arc<DeploymentManager>,
    endpoint: Arc<dyn AgentEndpointClient>,
    usage: Arc<UsageTracker>,
    event_bus: Arc<EventBus>,
    settings: ExecutionSettings,
    budget_guard: Option<Arc<BillingService>>,
    in_flight: DashMap<ExecutionId, CancellationToken>,
}

impl ExecutionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        hirings: Arc<dyn HiringRepository>,
        executions: Arc<dyn ExecutionRepository>,
        deployments: Arc<DeploymentManager>,
        endpoint: Arc<dyn AgentEndpointClient>,
        usage: Arc<UsageTracker>,
        event_bus: Arc<EventBus>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            agents,
            hirings,
            executions,
            deployments,
            endpoint,
            usage,
            event_bus,
            settings,
            budget_guard: None,
            in_flight: DashMap::new(),
        }
    }

    /// Refuse new non-cleanup executions for users already over their
    /// monthly budget.
    pub fn with_budget_guard(mut self, billing: Arc<BillingService>) -> Self {
        self.budget_guard = Some(billing);
        self
    }

    async fn load_hiring(&self, id: HiringId) -> Result<Hiring, OrchestrationError> {
        self.hirings
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("Hiring", id))
    }

    async fn load_agent(&self, hiring: &Hiring) -> Result<Agent, OrchestrationError> {
        self.agents
            .find_by_id(&hiring.agent_id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("Agent", &hiring.agent_id))
    }

    async fn load(&self, id: ExecutionId) -> Result<Execution, OrchestrationError> {
        self.executions
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("Execution", id))
    }

    /// Validates and persists a `pending` execution. Nothing is written when
    /// a check fails.
    pub async fn create_execution(
        &self,
        caller: &Caller,
        hiring_id: HiringId,
        execution_type: &str,
        input: Value,
    ) -> Result<Execution, OrchestrationError> {
        let execution_type: ExecutionType = execution_type
            .parse()
            .map_err(|e: ExecutionError| OrchestrationError::Validation(e.to_string()))?;
        let hiring = self.load_hiring(hiring_id).await?;

        if !caller.may_act_for(hiring.user_id, Capability::RunExecutions) {
            return Err(OrchestrationError::Unauthorized(format!(
                "{} may not run executions for hiring {}",
                caller, hiring_id
            )));
        }
        if hiring.status != HiringStatus::Active && execution_type != ExecutionType::Cleanup {
            return Err(OrchestrationError::Validation(format!(
                "Hiring {} is {}; only cleanup executions are accepted",
                hiring_id, hiring.status
            )));
        }

        let agent = self.load_agent(&hiring).await?;
        // Teardown cleanup still reaches agents that were rejected meanwhile.
        let service_cleanup =
            execution_type == ExecutionType::Cleanup && matches!(caller, Caller::Service(_));
        if !service_cleanup && !agent.is_accessible_by(hiring.user_id) {
            return Err(OrchestrationError::Unauthorized(format!(
                "Agent {} is not approved for user {}",
                agent.id, hiring.user_id
            )));
        }
        validate_optional(agent.io_schema.input.as_ref(), &input)
            .map_err(|e| OrchestrationError::Validation(format!("Input rejected: {}", e)))?;
        if let Some(billing) = &self.budget_guard {
            if execution_type != ExecutionType::Cleanup {
                billing.ensure_within_budget(hiring.user_id, 0.0).await?;
            }
        }

        let execution = Execution::new(hiring.id, hiring.user_id, agent.id.clone(), execution_type, input);
        self.executions.save(&execution).await?;
        info!(
            execution_id = %execution.id,
            hiring_id = %hiring.id,
            execution_type = %execution_type,
            caller = %caller,
            "Execution created"
        );
        self.event_bus.publish_execution_event(ExecutionEvent::ExecutionCreated {
            execution_id: execution.id,
            hiring_id: hiring.id,
            created_at: execution.created_at,
        });
        Ok(execution)
    }

    async fn begin(
        &self,
        id: ExecutionId,
    ) -> Result<(Execution, CancellationToken), OrchestrationError> {
        let mut execution = self.load(id).await?;
        execution
            .start()
            .map_err(|e| OrchestrationError::Validation(e.to_string()))?;
        if !self.executions.transition(&execution, ExecutionStatus::Pending).await? {
            return Err(OrchestrationError::Validation(format!(
                "Execution {} was already started",
                id
            )));
        }

        let token = CancellationToken::new();
        self.in_flight.insert(id, token.clone());
        self.event_bus.publish_execution_event(ExecutionEvent::ExecutionStarted {
            execution_id: id,
            hiring_id: execution.hiring_id,
            started_at: execution.started_at.unwrap_or_else(Utc::now),
        });
        counter!("aghub_executions_total", "status" => ExecutionStatus::Running.as_str()).increment(1);
        Ok((execution, token))
    }

    /// Flips the execution to `running` and hands dispatch to a background
    /// task. Observe completion with [`wait_for_execution`](Self::wait_for_execution).
    pub async fn run_execution(
        self: &Arc<Self>,
        id: ExecutionId,
    ) -> Result<Execution, OrchestrationError> {
        let (execution, token) = self.begin(id).await?;
        let service = Arc::clone(self);
        let running = execution.clone();
        tokio::spawn(async move {
            if let Err(e) = service.dispatch_and_finish(running, token).await {
                error!(execution_id = %id, "Execution bookkeeping failed: {}", e);
            }
        });
        Ok(execution)
    }

    /// Runs the execution to completion on the caller's task.
    pub async fn execute(&self, id: ExecutionId) -> Result<ExecutionResult, OrchestrationError> {
        let (execution, token) = self.begin(id).await?;
        self.dispatch_and_finish(execution, token).await
    }

    async fn dispatch_and_finish(
        &self,
        mut execution: Execution,
        token: CancellationToken,
    ) -> Result<ExecutionResult, OrchestrationError> {
        let id = execution.id;
        let started = Instant::now();
        let tracking = self
            .usage
            .start_usage_tracking(id, execution.hiring_id, execution.user_id)
            .await;
        if let Err(e) = &tracking {
            warn!(execution_id = %id, "Usage tracking unavailable: {}", e);
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => DispatchOutcome::Cancelled,
            outcome = self.dispatch(&execution) => outcome,
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        self.in_flight.remove(&id);

        let agent = self.agents.find_by_id(&execution.agent_id).await.ok().flatten();
        let transition = match outcome {
            DispatchOutcome::Completed(raw) => {
                let output = structure_output(raw, duration_ms);
                if let Some(agent) = &agent {
                    if let Err(e) = validate_optional(agent.io_schema.output.as_ref(), &output) {
                        warn!(
                            execution_id = %id,
                            agent_id = %agent.id,
                            "Output does not match schema: {}", e
                        );
                    }
                }
                if let Some(op) = output
                    .get("usage")
                    .and_then(|usage| UsageOperation::from_reported("agent_reported", usage))
                {
                    if tracking.is_ok() {
                        if let Err(e) = self.usage.record_operation(id, op).await {
                            warn!(execution_id = %id, "Reported usage not recorded: {}", e);
                        }
                    }
                }
                execution.complete(output, duration_ms)
            }
            DispatchOutcome::Failed { error, logs } => {
                warn!(execution_id = %id, "Execution failed: {}", error);
                execution.fail(error, logs, Some(duration_ms))
            }
            DispatchOutcome::TimedOut(error) => {
                warn!(execution_id = %id, "Execution timed out: {}", error);
                execution.time_out(error, duration_ms)
            }
            DispatchOutcome::Cancelled => execution.cancel(),
        };
        transition.map_err(|e| OrchestrationError::Validation(e.to_string()))?;

        let usage = if tracking.is_ok() {
            self.usage
                .end_usage_tracking(id, execution.status)
                .await
                .unwrap_or_else(|e| {
                    warn!(execution_id = %id, "Usage tracking not closed: {}", e);
                    UsageSummary {
                        execution_id: id,
                        duration_ms,
                        ..Default::default()
                    }
                })
        } else {
            UsageSummary {
                execution_id: id,
                duration_ms,
                ..Default::default()
            }
        };
        execution.usage = Some(usage.clone());

        if !self.executions.transition(&execution, ExecutionStatus::Running).await? {
            // Someone else (a cancel) already finished it.
            debug!(execution_id = %id, "Execution finished elsewhere, result dropped");
            let execution = self.load(id).await?;
            return Ok(ExecutionResult { execution, usage });
        }

        self.finished(&execution);
        Ok(ExecutionResult { execution, usage })
    }

    fn finished(&self, execution: &Execution) {
        info!(
            execution_id = %execution.id,
            status = %execution.status,
            duration_ms = ?execution.duration_ms,
            "Execution finished"
        );
        counter!("aghub_executions_total", "status" => execution.status.as_str()).increment(1);
        self.event_bus.publish_execution_event(ExecutionEvent::ExecutionFinished {
            execution_id: execution.id,
            hiring_id: execution.hiring_id,
            status: execution.status,
            error: execution.error_message.clone(),
            finished_at: execution.completed_at.unwrap_or_else(Utc::now),
        });
    }

    async fn dispatch(&self, execution: &Execution) -> DispatchOutcome {
        let agent = match self.agents.find_by_id(&execution.agent_id).await {
            Ok(Some(agent)) => agent,
            Ok(None) => return DispatchOutcome::failed(format!("Agent {} not found", execution.agent_id)),
            Err(e) => return DispatchOutcome::failed(e.to_string()),
        };

        let deployment = match self.running_deployment(execution.hiring_id).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => match self.settings.missing_deployment {
                MissingDeploymentPolicy::HardFail => {
                    return DispatchOutcome::failed(format!(
                        "no deployment found for hiring {}",
                        execution.hiring_id
                    ))
                }
            },
            Err(e) => return DispatchOutcome::failed(e.to_string()),
        };

        match agent.execution_model {
            ExecutionModel::Function => self.dispatch_exec(execution, &deployment).await,
            ExecutionModel::AcpServer | ExecutionModel::Persistent => {
                self.dispatch_chat(execution, &deployment).await
            }
        }
    }

    async fn running_deployment(
        &self,
        hiring_id: HiringId,
    ) -> Result<Option<Deployment>, OrchestrationError> {
        Ok(self
            .deployments
            .find_for_hiring(hiring_id)
            .await?
            .filter(Deployment::is_running))
    }

    async fn dispatch_exec(
        &self,
        execution: &Execution,
        deployment: &Deployment,
    ) -> DispatchOutcome {
        let context = json!({
            "execution_id": execution.id.to_string(),
            "execution_type": execution.execution_type.as_str(),
            "hiring_id": execution.hiring_id.0,
            "user_id": execution.user_id.0,
            "deployment_id": deployment.id.to_string(),
        });
        let cmd = vec![
            "python".to_string(),
            FUNCTION_RUNNER_PATH.to_string(),
            execution.input.to_string(),
            context.to_string(),
        ];

        let runtime = self.deployments.runtime();
        let result = tokio::time::timeout(
            self.settings.exec_timeout,
            runtime.exec(&deployment.container_name, cmd),
        )
        .await;

        match result {
            Err(_) => DispatchOutcome::TimedOut(format!(
                "Function did not finish within {:?}",
                self.settings.exec_timeout
            )),
            Ok(Err(e)) => DispatchOutcome::failed(e.to_string()),
            Ok(Ok(output)) if output.succeeded() => {
                DispatchOutcome::Completed(parse_runner_output(&output.stdout))
            }
            Ok(Ok(output)) => DispatchOutcome::Failed {
                error: format!("Function exited with code {}", output.exit_code),
                logs: output
                    .stderr
                    .lines()
                    .chain(output.stdout.lines())
                    .map(str::to_string)
                    .collect(),
            },
        }
    }

    async fn dispatch_chat(
        &self,
        execution: &Execution,
        deployment: &Deployment,
    ) -> DispatchOutcome {
        let Some(url) = self.deployments.endpoint_url(deployment) else {
            return DispatchOutcome::failed(format!("Deployment {} exposes no endpoint", deployment.id));
        };

        let request = chat_request(execution);
        match self
            .endpoint
            .chat(&url, &request, self.settings.request_timeout)
            .await
        {
            Ok(reply) => DispatchOutcome::Completed(reply),
            Err(EndpointError::Timeout(after)) => {
                DispatchOutcome::TimedOut(format!("Agent endpoint did not answer within {:?}", after))
            }
            Err(e) => DispatchOutcome::failed(e.to_string()),
        }
    }

    /// Cancels a `pending` or `running` execution. Terminal executions are
    /// returned unchanged.
    pub async fn cancel_execution(
        &self,
        caller: &Caller,
        id: ExecutionId,
    ) -> Result<Execution, OrchestrationError> {
        let mut execution = self.load(id).await?;
        if !caller.may_act_for(execution.user_id, Capability::RunExecutions) {
            return Err(OrchestrationError::Unauthorized(format!(
                "{} may not cancel execution {}",
                caller, id
            )));
        }
        if execution.status.is_terminal() {
            return Ok(execution);
        }

        let expected = execution.status;
        if expected == ExecutionStatus::Pending {
            // pending → running → cancelled, without ever dispatching.
            execution
                .start()
                .map_err(|e| OrchestrationError::Validation(e.to_string()))?;
        }
        execution
            .cancel()
            .map_err(|e| OrchestrationError::Validation(e.to_string()))?;

        if !self.executions.transition(&execution, expected).await? {
            return self.load(id).await;
        }
        if let Some((_, token)) = self.in_flight.remove(&id) {
            token.cancel();
        }
        info!(execution_id = %id, caller = %caller, "Execution cancelled");
        self.finished(&execution);
        Ok(execution)
    }

    pub async fn get_execution(
        &self,
        caller: &Caller,
        id: ExecutionId,
    ) -> Result<Execution, OrchestrationError> {
        let execution = self.load(id).await?;
        if !caller.may_act_for(execution.user_id, Capability::RunExecutions) {
            return Err(OrchestrationError::not_found("Execution", id));
        }
        Ok(execution)
    }

    pub async fn list_executions(
        &self,
        hiring_id: HiringId,
    ) -> Result<Vec<Execution>, OrchestrationError> {
        Ok(self.executions.list_by_hiring(hiring_id).await?)
    }

    /// Resolves when the execution is terminal, or returns the current record
    /// once `timeout` elapses.
    pub async fn wait_for_execution(
        &self,
        id: ExecutionId,
        timeout: Duration,
    ) -> Result<Execution, OrchestrationError> {
        let mut events = self.event_bus.subscribe_execution(id);
        let execution = self.load(id).await?;
        if execution.status.is_terminal() {
            return Ok(execution);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(ExecutionEvent::ExecutionFinished { .. })) => break,
                Ok(Ok(_)) => {}
                Ok(Err(_)) => {
                    if self.load(id).await?.status.is_terminal() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(_) => break,
            }
        }
        self.load(id).await
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Cancels every in-flight dispatch.
    pub fn shutdown(&self) {
        for entry in self.in_flight.iter() {
            entry.value().cancel();
        }
    }
}

/// `message` is `input.message` when it is a string, else the whole input as
/// JSON. Sessions default to one per hiring.
fn chat_request(execution: &Execution) -> ChatRequest {
    let message = match execution.input.get("message") {
        Some(Value::String(message)) => message.clone(),
        _ => execution.input.to_string(),
    };
    let session_id = execution
        .input
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("hiring-{}", execution.hiring_id));

    ChatRequest {
        message,
        session_id,
        context: json!({
            "execution_id": execution.id.to_string(),
            "execution_type": execution.execution_type.as_str(),
            "hiring_id": execution.hiring_id.0,
            "user_id": execution.user_id.0,
            "input": execution.input,
        }),
    }
}

/// Last `RESULT_MARKER` line wins; otherwise the whole stdout is tried as
/// JSON and finally kept as text.
pub(crate) fn parse_runner_output(stdout: &str) -> Value {
    if let Some(result) = stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(RESULT_MARKER))
    {
        if let Ok(value) = serde_json::from_str(result) {
            return value;
        }
    }
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

/// Objects are stored as returned; anything else is wrapped.
pub(crate) fn structure_output(raw: Value, duration_ms: u64) -> Value {
    match raw {
        Value::Object(_) => raw,
        other => json!({
            "output": other,
            "execution_time": duration_ms as f64 / 1000.0,
            "status": "success",
        }),
    }
}
