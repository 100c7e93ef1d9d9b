// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::AgentId;
use crate::domain::deployment::{DeploymentId, DeploymentStatus};
use crate::domain::execution::{ExecutionId, ExecutionStatus};
use crate::domain::hiring::{HiringId, HiringStatus, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeploymentEvent {
    DeploymentCreated {
        deployment_id: DeploymentId,
        hiring_id: HiringId,
        external_port: Option<u16>,
        created_at: DateTime<Utc>,
    },
    DeploymentStatusChanged {
        deployment_id: DeploymentId,
        hiring_id: HiringId,
        from: DeploymentStatus,
        to: DeploymentStatus,
        error: Option<String>,
        changed_at: DateTime<Utc>,
    },
    HealthChanged {
        deployment_id: DeploymentId,
        healthy: bool,
        consecutive_failures: u32,
        checked_at: DateTime<Utc>,
    },
}

impl DeploymentEvent {
    pub fn deployment_id(&self) -> &DeploymentId {
        match self {
            DeploymentEvent::DeploymentCreated { deployment_id, .. }
            | DeploymentEvent::DeploymentStatusChanged { deployment_id, .. }
            | DeploymentEvent::HealthChanged { deployment_id, .. } => deployment_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
    ExecutionCreated {
        execution_id: ExecutionId,
        hiring_id: HiringId,
        created_at: DateTime<Utc>,
    },
    ExecutionStarted {
        execution_id: ExecutionId,
        hiring_id: HiringId,
        started_at: DateTime<Utc>,
    },
    /// Emitted once per execution, when it reaches a terminal status.
    ExecutionFinished {
        execution_id: ExecutionId,
        hiring_id: HiringId,
        status: ExecutionStatus,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::ExecutionCreated { execution_id, .. }
            | ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::ExecutionFinished { execution_id, .. } => *execution_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HiringEvent {
    HiringCreated {
        hiring_id: HiringId,
        user_id: UserId,
        agent_id: AgentId,
        created_at: DateTime<Utc>,
    },
    HiringStatusChanged {
        hiring_id: HiringId,
        from: HiringStatus,
        to: HiringStatus,
        changed_at: DateTime<Utc>,
    },
    AgentRejected {
        agent_id: AgentId,
        succeeded: usize,
        failed: usize,
        rejected_at: DateTime<Utc>,
    },
}
