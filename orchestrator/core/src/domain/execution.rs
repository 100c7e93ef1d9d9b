// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::billing::UsageSummary;
use crate::domain::hiring::{HiringId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Initialize,
    Run,
    Cleanup,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Initialize => "initialize",
            ExecutionType::Run => "run",
            ExecutionType::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionType {
    type Err = ExecutionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "initialize" => Ok(ExecutionType::Initialize),
            "run" => Ok(ExecutionType::Run),
            "cleanup" => Ok(ExecutionType::Cleanup),
            other => Err(ExecutionError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "timeout" => Some(ExecutionStatus::Timeout),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }

    /// `pending → running → {completed, failed, timeout, cancelled}`
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (ExecutionStatus::Pending, ExecutionStatus::Running) => true,
            (ExecutionStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Unknown execution type '{0}'. Expected initialize, run or cleanup")]
    UnknownType(String),
    #[error("Invalid execution transition from {from} to {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub hiring_id: HiringId,
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub execution_type: ExecutionType,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    pub duration_ms: Option<u64>,
    pub usage: Option<UsageSummary>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        hiring_id: HiringId,
        user_id: UserId,
        agent_id: AgentId,
        execution_type: ExecutionType,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            hiring_id,
            user_id,
            agent_id,
            execution_type,
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error_message: None,
            logs: Vec::new(),
            duration_ms: None,
            usage: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn advance(&mut self, next: ExecutionStatus) -> Result<(), ExecutionError> {
        if !self.status.can_transition_to(next) {
            return Err(ExecutionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), ExecutionError> {
        self.advance(ExecutionStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(
        &mut self,
        output: serde_json::Value,
        duration_ms: u64,
    ) -> Result<(), ExecutionError> {
        self.advance(ExecutionStatus::Completed)?;
        self.output = Some(output);
        self.duration_ms = Some(duration_ms);
        Ok(())
    }

    pub fn fail(
        &mut self,
        error: impl Into<String>,
        logs: Vec<String>,
        duration_ms: Option<u64>,
    ) -> Result<(), ExecutionError> {
        self.advance(ExecutionStatus::Failed)?;
        self.error_message = Some(error.into());
        self.logs = logs;
        self.duration_ms = duration_ms;
        Ok(())
    }

    pub fn time_out(
        &mut self,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Result<(), ExecutionError> {
        self.advance(ExecutionStatus::Timeout)?;
        self.error_message = Some(error.into());
        self.duration_ms = Some(duration_ms);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), ExecutionError> {
        self.advance(ExecutionStatus::Cancelled)
    }
}
