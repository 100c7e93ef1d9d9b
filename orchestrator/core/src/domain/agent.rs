// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent aggregate as seen by the orchestration engine.
//!
//! Agents are submitted, packaged and moderated elsewhere; this engine only
//! reads them. The one write it performs is flipping `approval_status` to
//! `Rejected` when moderation pulls an agent (see `HiringCoordinator`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::deployment::DeploymentFlavor;
use crate::domain::hiring::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an agent is invoked once deployed.
///
/// Closed set: adding a model forces every dispatch site to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModel {
    /// Simple request/response code, invoked by a one-shot exec.
    Function,
    /// Long-running HTTP server speaking the `/chat` protocol.
    AcpServer,
    /// Stateful server driven through initialize/run/cleanup calls.
    Persistent,
}

impl ExecutionModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionModel::Function => "function",
            ExecutionModel::AcpServer => "acp_server",
            ExecutionModel::Persistent => "persistent",
        }
    }

    /// Short form used in deployment ids and container names.
    pub fn abbreviation(&self) -> &'static str {
        match self {
            ExecutionModel::Function => "func",
            ExecutionModel::AcpServer => "acp",
            ExecutionModel::Persistent => "persist",
        }
    }

    pub fn flavor(&self) -> DeploymentFlavor {
        match self {
            ExecutionModel::Function => DeploymentFlavor::Headless,
            ExecutionModel::AcpServer | ExecutionModel::Persistent => DeploymentFlavor::Networked,
        }
    }

    /// Stateful agents get a cleanup call before their container is torn down.
    pub fn is_stateful(&self) -> bool {
        matches!(self, ExecutionModel::Persistent)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "function" => Some(ExecutionModel::Function),
            "acp_server" => Some(ExecutionModel::AcpServer),
            "persistent" => Some(ExecutionModel::Persistent),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

/// JSON Schemas declared by the agent for its input and output payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentIoSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub version: String,
    pub name: String,
    pub creator_id: UserId,
    pub execution_model: ExecutionModel,
    /// Module or script the container runs (e.g. `main.py`).
    pub entry_point: String,
    #[serde(default)]
    pub io_schema: AgentIoSchema,
    /// Python package requirements, one specifier per entry.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Submitted source files keyed by relative path.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    pub approval_status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        id: AgentId,
        creator_id: UserId,
        execution_model: ExecutionModel,
        entry_point: impl Into<String>,
    ) -> Self {
        let name = id.0.clone();
        Self {
            id,
            version: "1.0.0".to_string(),
            name,
            creator_id,
            execution_model,
            entry_point: entry_point.into(),
            io_schema: AgentIoSchema::default(),
            requirements: Vec::new(),
            files: BTreeMap::new(),
            approval_status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.approval_status == ApprovalStatus::Approved
    }

    /// Approved agents are hireable by anyone; unapproved ones only by their creator.
    pub fn is_accessible_by(&self, user_id: UserId) -> bool {
        self.is_approved() || self.creator_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_flavors() {
        assert_eq!(ExecutionModel::Function.flavor(), DeploymentFlavor::Headless);
        assert_eq!(ExecutionModel::AcpServer.flavor(), DeploymentFlavor::Networked);
        assert_eq!(ExecutionModel::Persistent.flavor(), DeploymentFlavor::Networked);
        assert!(ExecutionModel::Persistent.is_stateful());
        assert!(!ExecutionModel::AcpServer.is_stateful());
    }

    #[test]
    fn test_access_rules() {
        let mut agent = Agent::new(AgentId::new("ABC123"), UserId(7), ExecutionModel::Function, "main.py");
        assert!(agent.is_accessible_by(UserId(7)));
        assert!(!agent.is_accessible_by(UserId(8)));

        agent.approval_status = ApprovalStatus::Approved;
        assert!(agent.is_accessible_by(UserId(8)));
    }

    #[test]
    fn test_model_parse_matches_as_str() {
        for model in [ExecutionModel::Function, ExecutionModel::AcpServer, ExecutionModel::Persistent] {
            assert_eq!(ExecutionModel::parse(model.as_str()), Some(model));
        }
        assert_eq!(ExecutionModel::parse("lambda"), None);
    }
}
