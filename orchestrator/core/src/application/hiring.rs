// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Hiring Lifecycle Coordinator
//!
//! The state machine users interact with. Hiring transitions drive the
//! Deployment Manager:
//!
//! | transition              | deployment effect                          |
//! |-------------------------|--------------------------------------------|
//! | create                  | create + background build                  |
//! | `active → suspended`    | stop container, keep records               |
//! | `suspended → active`    | background rebuild                         |
//! | `* → cancelled`         | stateful cleanup call, then full teardown  |
//! | `active → expired`      | stop container                             |
//!
//! Background work runs under the coordinator's own [`ServiceIdentity`], never
//! by borrowing the requesting user's authority.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::application::deployment_manager::DeploymentManager;
use crate::application::execution::ExecutionService;
use crate::domain::agent::{Agent, AgentId, ApprovalStatus};
use crate::domain::deployment::Deployment;
use crate::domain::error::OrchestrationError;
use crate::domain::events::HiringEvent;
use crate::domain::hiring::{Hiring, HiringId, HiringStatus, NewHiring, UserId};
use crate::domain::identity::{Caller, Capability, ServiceIdentity};
use crate::domain::repository::{AgentRepository, HiringRepository};
use crate::infrastructure::event_bus::EventBus;

/// What happened to the container side of a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// No container work was needed.
    NotNeeded,
    /// Container stopped (and removed) and confirmed gone.
    Clean,
    /// Stopped, but the runtime still listed the container when the poll ended.
    Incomplete,
    /// The runtime refused; the hiring transition still happened.
    Failed(String),
}

impl CleanupOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CleanupOutcome::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct HiringUpdate {
    pub hiring: Hiring,
    /// False when the hiring was already in the target status.
    pub changed: bool,
    pub cleanup: CleanupOutcome,
}

#[derive(Debug, Clone)]
pub struct CreatedHiring {
    pub hiring: Hiring,
    pub deployment: Deployment,
}

/// Aggregate result of an agent rejection fan-out.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<(HiringId, String)>,
}

impl CleanupReport {
    /// `PartialFailure` when any item failed.
    pub fn ensure_complete(&self) -> Result<(), OrchestrationError> {
        if self.failed == 0 {
            Ok(())
        } else {
            Err(OrchestrationError::PartialFailure {
                succeeded: self.succeeded,
                failed: self.failed,
            })
        }
    }
}

pub struct HiringCoordinator {
    agents: Arc<dyn AgentRepository>,
    hirings: Arc<dyn HiringRepository>,
    deployments: Arc<DeploymentManager>,
    executions: Arc<ExecutionService>,
    event_bus: Arc<EventBus>,
    identity: ServiceIdentity,
    teardown_timeout: Duration,
}

impl HiringCoordinator {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        hirings: Arc<dyn HiringRepository>,
        deployments: Arc<DeploymentManager>,
        executions: Arc<ExecutionService>,
        event_bus: Arc<EventBus>,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            agents,
            hirings,
            deployments,
            executions,
            event_bus,
            identity: ServiceIdentity::lifecycle_worker(),
            teardown_timeout,
        }
    }

    fn service_caller(&self) -> Caller {
        Caller::Service(self.identity.clone())
    }

    async fn load_agent(&self, id: &AgentId) -> Result<Agent, OrchestrationError> {
        self.agents
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("Agent", id))
    }

    pub async fn get_hiring(
        &self,
        caller: &Caller,
        id: HiringId,
    ) -> Result<Hiring, OrchestrationError> {
        let hiring = self
            .hirings
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("Hiring", id))?;
        if !caller.may_act_for(hiring.user_id, Capability::ManageHirings) {
            return Err(OrchestrationError::not_found("Hiring", id));
        }
        Ok(hiring)
    }

    pub async fn list_hirings(&self, user_id: UserId) -> Result<Vec<Hiring>, OrchestrationError> {
        Ok(self.hirings.list_by_user(user_id).await?)
    }

    /// Inserts an `active` hiring and its `pending` deployment, then queues
    /// the build. Returns before the image is built.
    pub async fn create_hiring(
        &self,
        caller: &Caller,
        request: NewHiring,
    ) -> Result<CreatedHiring, OrchestrationError> {
        if !caller.may_act_for(request.user_id, Capability::ManageHirings) {
            return Err(OrchestrationError::Unauthorized(format!(
                "{} may not hire agents for user {}",
                caller, request.user_id
            )));
        }
        let agent = self.load_agent(&request.agent_id).await?;
        if !agent.is_accessible_by(request.user_id) {
            return Err(OrchestrationError::Unauthorized(format!(
                "Agent {} is not approved",
                agent.id
            )));
        }

        let mut hiring = self.hirings.create(request).await?;
        info!(hiring_id = %hiring.id, user_id = %hiring.user_id, agent_id = %agent.id, "Hiring created");
        self.event_bus.publish_hiring_event(HiringEvent::HiringCreated {
            hiring_id: hiring.id,
            user_id: hiring.user_id,
            agent_id: agent.id.clone(),
            created_at: hiring.hired_at,
        });

        let deployment = match self.deployments.create_deployment(&hiring, &agent).await {
            Ok(deployment) => deployment,
            Err(e) => {
                // Hirings are never deleted; close this one out instead.
                warn!(hiring_id = %hiring.id, "Deployment could not be created, cancelling hiring: {}", e);
                self.set_status(&mut hiring, HiringStatus::Cancelled).await?;
                return Err(e);
            }
        };
        self.deployments.start_build(deployment.id.clone());

        Ok(CreatedHiring { hiring, deployment })
    }

    async fn set_status(
        &self,
        hiring: &mut Hiring,
        target: HiringStatus,
    ) -> Result<bool, OrchestrationError> {
        let from = hiring.status;
        if !hiring.transition_to(target) {
            return Ok(false);
        }
        self.hirings.save(hiring).await?;
        info!(hiring_id = %hiring.id, from = %from, to = %target, "Hiring status changed");
        self.event_bus.publish_hiring_event(HiringEvent::HiringStatusChanged {
            hiring_id: hiring.id,
            from,
            to: target,
            changed_at: hiring.updated_at,
        });
        Ok(true)
    }

    /// Moves the hiring to `target` and applies the container side effect.
    /// Re-entering the current status is a no-op except for `cancelled`,
    /// which always repeats the teardown.
    pub async fn update_hiring_status(
        &self,
        caller: &Caller,
        hiring_id: HiringId,
        target: HiringStatus,
        timeout: Option<Duration>,
    ) -> Result<HiringUpdate, OrchestrationError> {
        let mut hiring = self.get_hiring(caller, hiring_id).await?;
        if !hiring.can_transition_to(target) {
            return Err(OrchestrationError::Validation(format!(
                "Hiring {} is cancelled and cannot become {}",
                hiring_id, target
            )));
        }
        if hiring.status == target && target != HiringStatus::Cancelled {
            return Ok(HiringUpdate {
                hiring,
                changed: false,
                cleanup: CleanupOutcome::NotNeeded,
            });
        }

        let timeout = timeout.unwrap_or(self.teardown_timeout);
        let (changed, cleanup) = match target {
            HiringStatus::Suspended | HiringStatus::Expired => {
                let cleanup = self.stop_deployment(hiring_id, timeout).await;
                (self.set_status(&mut hiring, target).await?, cleanup)
            }
            HiringStatus::Active => {
                // Approval may have been withdrawn while the hiring was paused.
                let agent = self.load_agent(&hiring.agent_id).await?;
                if !agent.is_accessible_by(hiring.user_id) {
                    return Err(OrchestrationError::Unauthorized(format!(
                        "Agent {} is not approved",
                        agent.id
                    )));
                }
                let changed = self.set_status(&mut hiring, target).await?;
                self.resume_deployment(&hiring).await?;
                (changed, CleanupOutcome::NotNeeded)
            }
            HiringStatus::Cancelled => {
                let cleanup = self.teardown(&hiring, timeout).await;
                (self.set_status(&mut hiring, target).await?, cleanup)
            }
        };

        if let CleanupOutcome::Failed(reason) = &cleanup {
            warn!(hiring_id = %hiring_id, to = %target, "Container cleanup failed: {}", reason);
        }
        Ok(HiringUpdate {
            hiring,
            changed,
            cleanup,
        })
    }

    async fn stop_deployment(&self, hiring_id: HiringId, timeout: Duration) -> CleanupOutcome {
        let deployment = match self.deployments.find_for_hiring(hiring_id).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => return CleanupOutcome::NotNeeded,
            Err(e) => return CleanupOutcome::Failed(e.to_string()),
        };
        match self.deployments.stop_deployment(&deployment.id, Some(timeout)).await {
            Ok(teardown) if teardown.fully_cleaned => CleanupOutcome::Clean,
            Ok(_) => CleanupOutcome::Incomplete,
            Err(e) => CleanupOutcome::Failed(e.to_string()),
        }
    }

    async fn resume_deployment(&self, hiring: &Hiring) -> Result<(), OrchestrationError> {
        match self.deployments.find_for_hiring(hiring.id).await? {
            Some(deployment) if deployment.status.is_resumable() => {
                self.deployments.resume(&deployment.id).await?;
            }
            Some(_) => {}
            None => {
                let agent = self.load_agent(&hiring.agent_id).await?;
                let deployment = self.deployments.create_deployment(hiring, &agent).await?;
                self.deployments.start_build(deployment.id);
            }
        }
        Ok(())
    }

    /// Stateful agents get a chance to save state; then the deployment is
    /// cancelled. The cleanup call's failure never blocks the teardown.
    async fn teardown(&self, hiring: &Hiring, timeout: Duration) -> CleanupOutcome {
        let deployment = match self.deployments.find_for_hiring(hiring.id).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => return CleanupOutcome::NotNeeded,
            Err(e) => return CleanupOutcome::Failed(e.to_string()),
        };
        if deployment.execution_model.is_stateful() && deployment.is_running() {
            self.stateful_cleanup(hiring, timeout).await;
        }

        match self.deployments.cancel_deployment(&deployment.id, Some(timeout)).await {
            Ok(teardown) if teardown.fully_cleaned => CleanupOutcome::Clean,
            Ok(_) => CleanupOutcome::Incomplete,
            Err(e) => CleanupOutcome::Failed(e.to_string()),
        }
    }

    async fn stateful_cleanup(&self, hiring: &Hiring, timeout: Duration) {
        let caller = self.service_caller();
        let execution = match self
            .executions
            .create_execution(&caller, hiring.id, "cleanup", serde_json::json!({}))
            .await
        {
            Ok(execution) => execution,
            Err(e) => {
                warn!(hiring_id = %hiring.id, "Cleanup call not created: {}", e);
                return;
            }
        };
        match tokio::time::timeout(timeout, self.executions.execute(execution.id)).await {
            Ok(Ok(result)) => info!(
                hiring_id = %hiring.id,
                status = %result.execution.status,
                "Stateful cleanup call finished"
            ),
            Ok(Err(e)) => warn!(hiring_id = %hiring.id, "Stateful cleanup call failed: {}", e),
            Err(_) => warn!(hiring_id = %hiring.id, timeout = ?timeout, "Stateful cleanup call timed out"),
        }
    }

    /// Marks the agent rejected, suspends its active hirings and cancels every
    /// deployment. Each hiring is handled independently; one failure never
    /// stops the others.
    pub async fn reject_agent(
        &self,
        caller: &Caller,
        agent_id: &AgentId,
    ) -> Result<CleanupReport, OrchestrationError> {
        if !caller.has(Capability::ModerateAgents) {
            return Err(OrchestrationError::Unauthorized(format!(
                "{} may not moderate agents",
                caller
            )));
        }
        let mut agent = self.load_agent(agent_id).await?;
        agent.approval_status = ApprovalStatus::Rejected;
        self.agents.save(&agent).await?;

        let hirings = self.hirings.list_by_agent(agent_id).await?;
        let timeout = self.teardown_timeout;
        let outcomes = join_all(hirings.into_iter().map(|hiring| async move {
            let id = hiring.id;
            (id, self.reject_hiring(hiring, timeout).await)
        }))
        .await;

        let mut report = CleanupReport::default();
        for (hiring_id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    error!(hiring_id = %hiring_id, agent_id = %agent_id, "Rejection teardown failed: {}", e);
                    report.failed += 1;
                    report.failures.push((hiring_id, e.to_string()));
                }
            }
        }

        info!(
            agent_id = %agent_id,
            succeeded = report.succeeded,
            failed = report.failed,
            "Agent rejected"
        );
        self.event_bus.publish_hiring_event(HiringEvent::AgentRejected {
            agent_id: agent_id.clone(),
            succeeded: report.succeeded,
            failed: report.failed,
            rejected_at: Utc::now(),
        });
        Ok(report)
    }

    async fn reject_hiring(
        &self,
        mut hiring: Hiring,
        timeout: Duration,
    ) -> Result<(), OrchestrationError> {
        if hiring.is_active() {
            self.set_status(&mut hiring, HiringStatus::Suspended).await?;
        }
        let Some(deployment) = self.deployments.find_for_hiring(hiring.id).await? else {
            return Ok(());
        };
        self.deployments
            .cancel_deployment(&deployment.id, Some(timeout))
            .await?;
        Ok(())
    }

    /// Moves `active` hirings past their expiry to `expired` and stops their
    /// containers. Returns how many expired.
    pub async fn expire_hirings(&self, now: DateTime<Utc>) -> Result<usize, OrchestrationError> {
        let mut expired = 0;
        for mut hiring in self.hirings.list_expired(now).await? {
            if !hiring.is_active() || !hiring.is_expired_at(now) {
                continue;
            }
            let cleanup = self.stop_deployment(hiring.id, self.teardown_timeout).await;
            if let CleanupOutcome::Failed(reason) = cleanup {
                warn!(hiring_id = %hiring.id, "Expired hiring's container not stopped: {}", reason);
            }
            if self.set_status(&mut hiring, HiringStatus::Expired).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }
}
