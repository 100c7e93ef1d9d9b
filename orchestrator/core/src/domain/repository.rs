// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for each aggregate root. One repository per
//! aggregate, interface defined in the domain layer, implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `AgentRepository` | `Agent` | `InMemoryAgentRepository`, `PostgresAgentRepository` |
//! | `HiringRepository` | `Hiring` | `InMemoryHiringRepository`, `PostgresHiringRepository` |
//! | `DeploymentRepository` | `Deployment` | `InMemoryDeploymentRepository`, `PostgresDeploymentRepository` |
//! | `ExecutionRepository` | `Execution` | `InMemoryExecutionRepository`, `PostgresExecutionRepository` |
//! | `UsageRepository` | snapshots, aggregates, budgets | `InMemoryUsageRepository`, `PostgresUsageRepository` |
//!
//! Concrete implementations are selected at startup from the `storage`
//! section of `aghub-config.yaml`. Hirings, deployments and snapshots are never
//! physically deleted, so none of these traits expose `delete`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::agent::{Agent, AgentId};
use crate::domain::billing::{
    AggregationPeriod, AggregationScope, ExecutionUsage, ResourceSnapshot, UsageAggregation,
};
use crate::domain::deployment::{Deployment, DeploymentId, DeploymentStatus};
use crate::domain::execution::{Execution, ExecutionId, ExecutionStatus};
use crate::domain::hiring::{Hiring, HiringId, NewHiring, UserId};

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Save agent (create or update)
    async fn save(&self, agent: &Agent) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &AgentId) -> Result<Option<Agent>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Agent>, RepositoryError>;
}

#[async_trait]
pub trait HiringRepository: Send + Sync {
    /// Inserts a new hiring and assigns its id.
    async fn create(&self, request: NewHiring) -> Result<Hiring, RepositoryError>;

    async fn save(&self, hiring: &Hiring) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: HiringId) -> Result<Option<Hiring>, RepositoryError>;

    async fn list_by_agent(&self, agent_id: &AgentId) -> Result<Vec<Hiring>, RepositoryError>;

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Hiring>, RepositoryError>;

    /// Active hirings whose `expires_at` is at or before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Hiring>, RepositoryError>;
}

#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    /// Save deployment (create or update). Fails with `Conflict` when the
    /// external port is already held by another non-terminal deployment.
    async fn save(&self, deployment: &Deployment) -> Result<(), RepositoryError>;

    /// Persists `deployment` only if the stored status still equals `expected`.
    /// Returns `false` when another writer moved it first.
    async fn transition(
        &self,
        deployment: &Deployment,
        expected: DeploymentStatus,
    ) -> Result<bool, RepositoryError>;

    async fn find_by_id(&self, id: &DeploymentId) -> Result<Option<Deployment>, RepositoryError>;

    /// Most recently created deployment of a hiring.
    async fn find_by_hiring(&self, hiring_id: HiringId) -> Result<Option<Deployment>, RepositoryError>;

    async fn list_by_status(&self, status: DeploymentStatus) -> Result<Vec<Deployment>, RepositoryError>;

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Deployment>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Deployment>, RepositoryError>;

    /// External ports held by non-terminal deployments.
    async fn ports_in_use(&self) -> Result<Vec<u16>, RepositoryError>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Save execution (create or update)
    async fn save(&self, execution: &Execution) -> Result<(), RepositoryError>;

    /// Persists `execution` only if the stored status still equals `expected`.
    /// Returns `false` when another writer got there first.
    async fn transition(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> Result<bool, RepositoryError>;

    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<Execution>, RepositoryError>;

    async fn list_by_hiring(&self, hiring_id: HiringId) -> Result<Vec<Execution>, RepositoryError>;
}

/// Selects snapshots; unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct SnapshotQuery {
    pub deployment_id: Option<DeploymentId>,
    pub hiring_id: Option<HiringId>,
    pub user_id: Option<UserId>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl SnapshotQuery {
    pub fn matches(&self, snapshot: &ResourceSnapshot) -> bool {
        self.deployment_id.as_ref().map_or(true, |id| &snapshot.deployment_id == id)
            && self.hiring_id.map_or(true, |id| snapshot.hiring_id == id)
            && self.user_id.map_or(true, |id| snapshot.user_id == id)
            && self.from.map_or(true, |from| snapshot.collected_at >= from)
            && self.until.map_or(true, |until| snapshot.collected_at < until)
    }

    pub fn for_window(scope: &AggregationScope, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        let mut query = Self {
            from: Some(from),
            until: Some(until),
            ..Default::default()
        };
        match scope {
            AggregationScope::Deployment(id) => query.deployment_id = Some(id.clone()),
            AggregationScope::User(id) => query.user_id = Some(*id),
        }
        query
    }
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn insert_snapshot(&self, snapshot: &ResourceSnapshot) -> Result<(), RepositoryError>;

    async fn list_snapshots(&self, query: &SnapshotQuery) -> Result<Vec<ResourceSnapshot>, RepositoryError>;

    /// Insert or replace the aggregate for `(scope, period, period_start)`.
    async fn upsert_aggregation(&self, aggregation: &UsageAggregation) -> Result<(), RepositoryError>;

    async fn find_aggregation(
        &self,
        scope: &AggregationScope,
        period: AggregationPeriod,
        period_start: DateTime<Utc>,
    ) -> Result<Option<UsageAggregation>, RepositoryError>;

    async fn save_execution_usage(&self, usage: &ExecutionUsage) -> Result<(), RepositoryError>;

    async fn find_execution_usage(&self, id: ExecutionId) -> Result<Option<ExecutionUsage>, RepositoryError>;

    /// Execution usage for a user started in `[from, until)`.
    async fn list_execution_usage(
        &self,
        user_id: UserId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ExecutionUsage>, RepositoryError>;

    /// `None` clears the user's own budget so the configured default applies.
    async fn set_monthly_budget(&self, user_id: UserId, budget: Option<f64>) -> Result<(), RepositoryError>;

    async fn monthly_budget(&self, user_id: UserId) -> Result<Option<f64>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::Conflict(db.message().to_string())
            }
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
