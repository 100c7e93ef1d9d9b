// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Deployment Aggregate
//!
//! The containerized instance of an agent for one hiring, and the lifecycle
//! state machine the `DeploymentManager` drives it through:
//!
//! ```text
//! pending → building → deploying → running → { stopped | failed | crashed }
//!                                            ↘ cancelled (audit only)
//! ```
//!
//! `stopped`, `failed` and `crashed` are not resumed automatically; resuming
//! re-enters `building` with a full rebuild.
//!
//! ## Naming
//!
//! Container and image names are a contract with operators and log tooling,
//! so they are derived deterministically from the deployment identity:
//!
//! - container: `aghub-{abbr}-user_{user}-id_{agent}-hire_{hiring}-{id[..8]}`,
//!   falling back to `aghub-{abbr}-user_{user}-id_{agent}-{md5(id)[..12]}`
//!   once the canonical form exceeds [`MAX_NAME_LEN`] characters;
//! - image: `{model}_{user}_{agent}:{hiring}_{uuid}`.

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::agent::{AgentId, ExecutionModel};
use crate::domain::hiring::{HiringId, UserId};

/// Docker accepts longer names, but downstream log shippers truncate at 64.
pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentId(pub String);

impl DeploymentId {
    /// `{abbr}-user-{user}-agent-{agent}-hire-{hiring}-{first 8 hex of uuid}`
    pub fn generate(
        model: ExecutionModel,
        user_id: UserId,
        agent_id: &AgentId,
        hiring_id: HiringId,
        uuid: Uuid,
    ) -> Self {
        let suffix = uuid.simple().to_string();
        Self(format!(
            "{}-user-{}-agent-{}-hire-{}-{}",
            model.abbreviation(),
            user_id,
            agent_id,
            hiring_id,
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Deploying,
    Running,
    Stopped,
    Failed,
    Crashed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Crashed => "crashed",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeploymentStatus::Pending),
            "building" => Some(DeploymentStatus::Building),
            "deploying" => Some(DeploymentStatus::Deploying),
            "running" => Some(DeploymentStatus::Running),
            "stopped" => Some(DeploymentStatus::Stopped),
            "failed" => Some(DeploymentStatus::Failed),
            "crashed" => Some(DeploymentStatus::Crashed),
            "cancelled" => Some(DeploymentStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal deployments hold no port and no container.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Stopped
                | DeploymentStatus::Failed
                | DeploymentStatus::Crashed
                | DeploymentStatus::Cancelled
        )
    }

    /// Statuses from which a rebuild may start.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Pending
                | DeploymentStatus::Stopped
                | DeploymentStatus::Failed
                | DeploymentStatus::Crashed
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentFlavor {
    /// Exposes an HTTP endpoint on an allocated host port.
    Networked,
    /// Idles until invoked through a one-shot exec; never gets a host port.
    Headless,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeploymentError {
    #[error("Invalid deployment transition from {from} to {to}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    /// Random component of the id, also used in the image tag.
    pub uuid: Uuid,
    pub hiring_id: HiringId,
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub execution_model: ExecutionModel,
    pub flavor: DeploymentFlavor,
    pub container_id: Option<String>,
    pub container_name: String,
    pub image_name: String,
    pub internal_port: Option<u16>,
    pub external_port: Option<u16>,
    pub status: DeploymentStatus,
    pub is_healthy: bool,
    pub health_check_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Build output or container logs captured on failure.
    #[serde(default)]
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Creates a `pending` deployment. Ports are only kept for networked models.
    pub fn new(
        hiring_id: HiringId,
        user_id: UserId,
        agent_id: AgentId,
        execution_model: ExecutionModel,
        internal_port: Option<u16>,
        external_port: Option<u16>,
    ) -> Self {
        let uuid = Uuid::new_v4();
        let id = DeploymentId::generate(execution_model, user_id, &agent_id, hiring_id, uuid);
        let flavor = execution_model.flavor();
        let (internal_port, external_port) = match flavor {
            DeploymentFlavor::Networked => (internal_port, external_port),
            DeploymentFlavor::Headless => (None, None),
        };
        let container_name = container_name(execution_model, user_id, &agent_id, hiring_id, &id);
        let image_name = image_name(execution_model, user_id, &agent_id, hiring_id, &id, uuid);
        let now = Utc::now();

        Self {
            id,
            uuid,
            hiring_id,
            user_id,
            agent_id,
            execution_model,
            flavor,
            container_id: None,
            container_name,
            image_name,
            internal_port,
            external_port,
            status: DeploymentStatus::Pending,
            is_healthy: false,
            health_check_failures: 0,
            last_health_check: None,
            error_message: None,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        }
    }

    pub fn is_networked(&self) -> bool {
        self.flavor == DeploymentFlavor::Networked
    }

    pub fn is_running(&self) -> bool {
        self.status == DeploymentStatus::Running
    }

    fn set_status(&mut self, status: DeploymentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// `pending|stopped|failed|crashed → building`
    pub fn begin_build(&mut self) -> Result<(), DeploymentError> {
        if !self.status.is_resumable() {
            return Err(DeploymentError::InvalidTransition {
                from: self.status,
                to: DeploymentStatus::Building,
            });
        }
        self.error_message = None;
        self.logs.clear();
        self.container_id = None;
        self.is_healthy = false;
        self.health_check_failures = 0;
        self.stopped_at = None;
        self.set_status(DeploymentStatus::Building);
        Ok(())
    }

    /// `building → deploying`
    pub fn begin_deploy(&mut self) -> Result<(), DeploymentError> {
        if self.status != DeploymentStatus::Building {
            return Err(DeploymentError::InvalidTransition {
                from: self.status,
                to: DeploymentStatus::Deploying,
            });
        }
        self.set_status(DeploymentStatus::Deploying);
        Ok(())
    }

    /// `deploying → running`
    pub fn mark_running(&mut self, container_id: String) -> Result<(), DeploymentError> {
        if self.status != DeploymentStatus::Deploying {
            return Err(DeploymentError::InvalidTransition {
                from: self.status,
                to: DeploymentStatus::Running,
            });
        }
        self.container_id = Some(container_id);
        self.started_at = Some(Utc::now());
        self.is_healthy = true;
        self.set_status(DeploymentStatus::Running);
        Ok(())
    }

    /// Any in-flight stage can fail; the record stays inspectable.
    pub fn mark_failed(&mut self, error: impl Into<String>, logs: Vec<String>) {
        self.error_message = Some(error.into());
        self.logs = logs;
        self.is_healthy = false;
        self.set_status(DeploymentStatus::Failed);
    }

    pub fn mark_crashed(&mut self, reason: impl Into<String>) {
        self.error_message = Some(reason.into());
        self.is_healthy = false;
        self.stopped_at = Some(Utc::now());
        self.set_status(DeploymentStatus::Crashed);
    }

    pub fn mark_stopped(&mut self) {
        self.is_healthy = false;
        self.stopped_at = Some(Utc::now());
        self.set_status(DeploymentStatus::Stopped);
    }

    pub fn mark_cancelled(&mut self) {
        self.is_healthy = false;
        if self.stopped_at.is_none() {
            self.stopped_at = Some(Utc::now());
        }
        self.set_status(DeploymentStatus::Cancelled);
    }

    pub fn record_health(&mut self, healthy: bool) {
        self.last_health_check = Some(Utc::now());
        self.is_healthy = healthy;
        if healthy {
            self.health_check_failures = 0;
        } else {
            self.health_check_failures += 1;
        }
        self.updated_at = Utc::now();
    }
}

/// Container name per the naming contract, guaranteed `<= MAX_NAME_LEN`.
pub fn container_name(
    model: ExecutionModel,
    user_id: UserId,
    agent_id: &AgentId,
    hiring_id: HiringId,
    deployment_id: &DeploymentId,
) -> String {
    let id_prefix: String = deployment_id.as_str().chars().take(8).collect();
    let canonical = format!(
        "aghub-{}-user_{}-id_{}-hire_{}-{}",
        model.abbreviation(),
        user_id,
        agent_id,
        hiring_id,
        id_prefix
    );
    if canonical.len() <= MAX_NAME_LEN {
        return canonical;
    }

    let digest = short_digest(deployment_id);
    let hashed = format!(
        "aghub-{}-user_{}-id_{}-{}",
        model.abbreviation(),
        user_id,
        agent_id,
        digest
    );
    if hashed.len() <= MAX_NAME_LEN {
        return hashed;
    }

    // Agent ids long enough to overflow even the hashed form lose the agent part.
    format!("aghub-{}-user_{}-{}", model.abbreviation(), user_id, digest)
}

/// Image reference `{model}_{user}_{agent}:{hiring}_{uuid}`, guaranteed `<= MAX_NAME_LEN`.
pub fn image_name(
    model: ExecutionModel,
    user_id: UserId,
    agent_id: &AgentId,
    hiring_id: HiringId,
    deployment_id: &DeploymentId,
    uuid: Uuid,
) -> String {
    let canonical = format!(
        "{}_{}_{}:{}_{}",
        model.as_str(),
        user_id,
        normalize_component(agent_id.as_str()),
        hiring_id,
        uuid.simple()
    );
    if canonical.len() <= MAX_NAME_LEN {
        return canonical;
    }
    format!(
        "{}_{}:{}_{}",
        model.as_str(),
        user_id,
        hiring_id,
        short_digest(deployment_id)
    )
}

/// Lowercases and replaces anything Docker rejects in a repository name.
pub fn normalize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// First 12 hex characters of `md5(deployment_id)`.
fn short_digest(deployment_id: &DeploymentId) -> String {
    let digest = Md5::digest(deployment_id.as_str().as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(12);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_for(model: ExecutionModel, agent: &str) -> DeploymentId {
        DeploymentId::generate(
            model,
            UserId(1),
            &AgentId::new(agent),
            HiringId(1),
            Uuid::parse_str("1a2b3c4d-0000-4000-8000-000000000000").unwrap(),
        )
    }

    fn fresh(model: ExecutionModel) -> Deployment {
        Deployment::new(
            HiringId(1),
            UserId(1),
            AgentId::new("ABC123"),
            model,
            Some(8000),
            Some(9100),
        )
    }

    #[test]
    fn test_deployment_id_format() {
        let id = id_for(ExecutionModel::Function, "ABC123");
        assert_eq!(id.as_str(), "func-user-1-agent-ABC123-hire-1-1a2b3c4d");
    }

    #[test]
    fn test_canonical_container_name() {
        let id = id_for(ExecutionModel::Function, "ABC123");
        let name = container_name(
            ExecutionModel::Function,
            UserId(1),
            &AgentId::new("ABC123"),
            HiringId(1),
            &id,
        );
        assert_eq!(name, "aghub-func-user_1-id_ABC123-hire_1-func-use");
    }

    #[test]
    fn test_long_container_name_falls_back_to_hash() {
        let agent = AgentId::new("agent-identifier-0123456789x");
        let id = DeploymentId::generate(
            ExecutionModel::AcpServer,
            UserId(42),
            &agent,
            HiringId(1000),
            Uuid::new_v4(),
        );
        let name = container_name(ExecutionModel::AcpServer, UserId(42), &agent, HiringId(1000), &id);

        assert!(name.len() <= MAX_NAME_LEN);
        let digest = short_digest(&id);
        assert_eq!(digest.len(), 12);
        assert!(name.ends_with(&digest));
        assert!(!name.contains("hire_"));
        assert!(name.starts_with("aghub-acp-user_42-id_agent-identifier-0123456789x-"));

        // Deterministic for the same deployment id.
        let again = container_name(ExecutionModel::AcpServer, UserId(42), &agent, HiringId(1000), &id);
        assert_eq!(name, again);
    }

    #[test]
    fn test_oversized_agent_id_still_fits() {
        let agent = AgentId::new("x".repeat(120));
        let id = DeploymentId::generate(
            ExecutionModel::Persistent,
            UserId(9),
            &agent,
            HiringId(3),
            Uuid::new_v4(),
        );
        let name = container_name(ExecutionModel::Persistent, UserId(9), &agent, HiringId(3), &id);
        let image = image_name(
            ExecutionModel::Persistent,
            UserId(9),
            &agent,
            HiringId(3),
            &id,
            Uuid::new_v4(),
        );
        assert!(name.len() <= MAX_NAME_LEN);
        assert!(image.len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_image_name_format() {
        let uuid = Uuid::parse_str("1a2b3c4d-0000-4000-8000-000000000000").unwrap();
        let agent = AgentId::new("ABC-123");
        let id = DeploymentId::generate(ExecutionModel::Function, UserId(1), &agent, HiringId(1), uuid);
        let image = image_name(ExecutionModel::Function, UserId(1), &agent, HiringId(1), &id, uuid);
        assert_eq!(image, "function_1_abc_123:1_1a2b3c4d000040008000000000000000");
    }

    #[test]
    fn test_headless_deployment_never_holds_ports() {
        let deployment = fresh(ExecutionModel::Function);
        assert_eq!(deployment.flavor, DeploymentFlavor::Headless);
        assert_eq!(deployment.external_port, None);
        assert_eq!(deployment.internal_port, None);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut deployment = fresh(ExecutionModel::AcpServer);
        assert!(deployment.begin_deploy().is_err());
        deployment.begin_build().unwrap();
        deployment.begin_deploy().unwrap();
        deployment.mark_running("c0ffee".to_string()).unwrap();
        assert!(deployment.is_running());
        assert!(deployment.begin_build().is_err());

        deployment.mark_stopped();
        assert!(deployment.status.is_terminal());
        deployment.begin_build().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Building);
        assert!(deployment.container_id.is_none());
    }

    #[test]
    fn test_cancelled_is_not_resumable() {
        let mut deployment = fresh(ExecutionModel::AcpServer);
        deployment.mark_cancelled();
        assert_eq!(
            deployment.begin_build(),
            Err(DeploymentError::InvalidTransition {
                from: DeploymentStatus::Cancelled,
                to: DeploymentStatus::Building
            })
        );
    }

    #[test]
    fn test_health_counter() {
        let mut deployment = fresh(ExecutionModel::AcpServer);
        deployment.record_health(false);
        deployment.record_health(false);
        assert_eq!(deployment.health_check_failures, 2);
        assert!(!deployment.is_healthy);
        deployment.record_health(true);
        assert_eq!(deployment.health_check_failures, 0);
        assert!(deployment.is_healthy);
    }
}
