// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve domain aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! - **PostgresAgentRepository** - Agent code and metadata
//! - **PostgresHiringRepository** - Hiring subscriptions (never deleted)
//! - **PostgresDeploymentRepository** - Deployment state, port uniqueness via partial index
//! - **PostgresExecutionRepository** - Execution state with compare-and-set transitions
//! - **PostgresUsageRepository** - Snapshots, aggregates, execution usage, budgets
//!
//! ## In-Memory Repositories
//!
//! Lock-protected maps with the same semantics, used for development and
//! tests.

pub mod postgres_agent;
pub mod postgres_deployment;
pub mod postgres_execution;
pub mod postgres_hiring;
pub mod postgres_usage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::domain::agent::{Agent, AgentId};
use crate::domain::billing::{AggregationPeriod, AggregationScope, ExecutionUsage, ResourceSnapshot, UsageAggregation};
use crate::domain::deployment::{Deployment, DeploymentId, DeploymentStatus};
use crate::domain::execution::{Execution, ExecutionId, ExecutionStatus};
use crate::domain::hiring::{Hiring, HiringId, HiringStatus, NewHiring, UserId};
use crate::domain::repository::{
    AgentRepository, DeploymentRepository, ExecutionRepository, HiringRepository,
    RepositoryError, SnapshotQuery, UsageRepository,
};

#[derive(Clone, Default)]
pub struct InMemoryAgentRepository {
    agents: Arc<RwLock<HashMap<AgentId, Agent>>>,
}

impl InMemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn save(&self, agent: &Agent) -> Result<(), RepositoryError> {
        self.agents.write().insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &AgentId) -> Result<Option<Agent>, RepositoryError> {
        Ok(self.agents.read().get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Agent>, RepositoryError> {
        let mut agents: Vec<Agent> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }
}

#[derive(Clone)]
pub struct InMemoryHiringRepository {
    hirings: Arc<RwLock<HashMap<HiringId, Hiring>>>,
    next_id: Arc<AtomicI64>,
}

impl InMemoryHiringRepository {
    pub fn new() -> Self {
        Self {
            hirings: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    fn collect(&self, filter: impl Fn(&Hiring) -> bool) -> Vec<Hiring> {
        let mut hirings: Vec<Hiring> = self.hirings.read().values().filter(|h| filter(h)).cloned().collect();
        hirings.sort_by_key(|h| h.id);
        hirings
    }
}

impl Default for InMemoryHiringRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HiringRepository for InMemoryHiringRepository {
    async fn create(&self, request: NewHiring) -> Result<Hiring, RepositoryError> {
        let id = HiringId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let hiring = Hiring::from_request(id, request);
        self.hirings.write().insert(id, hiring.clone());
        Ok(hiring)
    }

    async fn save(&self, hiring: &Hiring) -> Result<(), RepositoryError> {
        let mut hirings = self.hirings.write();
        if !hirings.contains_key(&hiring.id) {
            return Err(RepositoryError::NotFound(format!("hiring {}", hiring.id)));
        }
        hirings.insert(hiring.id, hiring.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: HiringId) -> Result<Option<Hiring>, RepositoryError> {
        Ok(self.hirings.read().get(&id).cloned())
    }

    async fn list_by_agent(&self, agent_id: &AgentId) -> Result<Vec<Hiring>, RepositoryError> {
        Ok(self.collect(|h| &h.agent_id == agent_id))
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Hiring>, RepositoryError> {
        Ok(self.collect(|h| h.user_id == user_id))
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Hiring>, RepositoryError> {
        Ok(self.collect(|h| h.status == HiringStatus::Active && h.is_expired_at(now)))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDeploymentRepository {
    deployments: Arc<RwLock<HashMap<DeploymentId, Deployment>>>,
}

impl InMemoryDeploymentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, filter: impl Fn(&Deployment) -> bool) -> Vec<Deployment> {
        let mut deployments: Vec<Deployment> =
            self.deployments.read().values().filter(|d| filter(d)).cloned().collect();
        deployments.sort_by_key(|d| d.created_at);
        deployments
    }
}

fn check_port_free(
    deployments: &HashMap<DeploymentId, Deployment>,
    deployment: &Deployment,
) -> Result<(), RepositoryError> {
    if let (Some(port), false) = (deployment.external_port, deployment.status.is_terminal()) {
        let taken = deployments.values().any(|other| {
            other.id != deployment.id && !other.status.is_terminal() && other.external_port == Some(port)
        });
        if taken {
            return Err(RepositoryError::Conflict(format!(
                "external port {} is held by another live deployment",
                port
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl DeploymentRepository for InMemoryDeploymentRepository {
    async fn save(&self, deployment: &Deployment) -> Result<(), RepositoryError> {
        let mut deployments = self.deployments.write();
        check_port_free(&deployments, deployment)?;
        deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn transition(
        &self,
        deployment: &Deployment,
        expected: DeploymentStatus,
    ) -> Result<bool, RepositoryError> {
        let mut deployments = self.deployments.write();
        match deployments.get(&deployment.id) {
            Some(stored) if stored.status == expected => {}
            Some(_) => return Ok(false),
            None => return Err(RepositoryError::NotFound(format!("deployment {}", deployment.id))),
        }
        check_port_free(&deployments, deployment)?;
        deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(true)
    }

    async fn find_by_id(&self, id: &DeploymentId) -> Result<Option<Deployment>, RepositoryError> {
        Ok(self.deployments.read().get(id).cloned())
    }

    async fn find_by_hiring(
        &self,
        hiring_id: HiringId,
    ) -> Result<Option<Deployment>, RepositoryError> {
        Ok(self.collect(|d| d.hiring_id == hiring_id).pop())
    }

    async fn list_by_status(
        &self,
        status: DeploymentStatus,
    ) -> Result<Vec<Deployment>, RepositoryError> {
        Ok(self.collect(|d| d.status == status))
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Deployment>, RepositoryError> {
        Ok(self.collect(|d| d.user_id == user_id))
    }

    async fn list_all(&self) -> Result<Vec<Deployment>, RepositoryError> {
        Ok(self.collect(|_| true))
    }

    async fn ports_in_use(&self) -> Result<Vec<u16>, RepositoryError> {
        let mut ports: Vec<u16> = self
            .deployments
            .read()
            .values()
            .filter(|d| !d.status.is_terminal())
            .filter_map(|d| d.external_port)
            .collect();
        ports.sort_unstable();
        Ok(ports)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryExecutionRepository {
    executions: Arc<RwLock<HashMap<ExecutionId, Execution>>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, execution: &Execution) -> Result<(), RepositoryError> {
        self.executions.write().insert(execution.id, execution.clone());
        Ok(())
    }

    async fn transition(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> Result<bool, RepositoryError> {
        let mut executions = self.executions.write();
        match executions.get(&execution.id) {
            Some(stored) if stored.status == expected => {
                executions.insert(execution.id, execution.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("execution {}", execution.id))),
        }
    }

    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.read().get(&id).cloned())
    }

    async fn list_by_hiring(&self, hiring_id: HiringId) -> Result<Vec<Execution>, RepositoryError> {
        let mut executions: Vec<Execution> = self
            .executions
            .read()
            .values()
            .filter(|e| e.hiring_id == hiring_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }
}

type AggregationKey = (AggregationScope, AggregationPeriod, DateTime<Utc>);

#[derive(Clone, Default)]
pub struct InMemoryUsageRepository {
    snapshots: Arc<RwLock<Vec<ResourceSnapshot>>>,
    aggregations: Arc<RwLock<HashMap<AggregationKey, UsageAggregation>>>,
    executions: Arc<RwLock<HashMap<ExecutionId, ExecutionUsage>>>,
    budgets: Arc<RwLock<HashMap<UserId, f64>>>,
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn insert_snapshot(&self, snapshot: &ResourceSnapshot) -> Result<(), RepositoryError> {
        let mut snapshots = self.snapshots.write();
        if snapshots.iter().any(|s| s.id == snapshot.id) {
            return Err(RepositoryError::Conflict(format!("snapshot {} already recorded", snapshot.id)));
        }
        snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn list_snapshots(
        &self,
        query: &SnapshotQuery,
    ) -> Result<Vec<ResourceSnapshot>, RepositoryError> {
        let mut snapshots: Vec<ResourceSnapshot> =
            self.snapshots.read().iter().filter(|s| query.matches(s)).cloned().collect();
        snapshots.sort_by_key(|s| s.collected_at);
        Ok(snapshots)
    }

    async fn upsert_aggregation(
        &self,
        aggregation: &UsageAggregation,
    ) -> Result<(), RepositoryError> {
        let key = (aggregation.scope.clone(), aggregation.period, aggregation.period_start);
        self.aggregations.write().insert(key, aggregation.clone());
        Ok(())
    }

    async fn find_aggregation(
        &self,
        scope: &AggregationScope,
        period: AggregationPeriod,
        period_start: DateTime<Utc>,
    ) -> Result<Option<UsageAggregation>, RepositoryError> {
        let key = (scope.clone(), period, period_start);
        Ok(self.aggregations.read().get(&key).cloned())
    }

    async fn save_execution_usage(&self, usage: &ExecutionUsage) -> Result<(), RepositoryError> {
        self.executions.write().insert(usage.execution_id, usage.clone());
        Ok(())
    }

    async fn find_execution_usage(
        &self,
        id: ExecutionId,
    ) -> Result<Option<ExecutionUsage>, RepositoryError> {
        Ok(self.executions.read().get(&id).cloned())
    }

    async fn list_execution_usage(
        &self,
        user_id: UserId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ExecutionUsage>, RepositoryError> {
        let mut usage: Vec<ExecutionUsage> = self
            .executions
            .read()
            .values()
            .filter(|u| u.user_id == user_id && u.started_at >= from && u.started_at < until)
            .cloned()
            .collect();
        usage.sort_by_key(|u| u.started_at);
        Ok(usage)
    }

    async fn set_monthly_budget(
        &self,
        user_id: UserId,
        budget: Option<f64>,
    ) -> Result<(), RepositoryError> {
        let mut budgets = self.budgets.write();
        match budget {
            Some(amount) => budgets.insert(user_id, amount),
            None => budgets.remove(&user_id),
        };
        Ok(())
    }

    async fn monthly_budget(&self, user_id: UserId) -> Result<Option<f64>, RepositoryError> {
        Ok(self.budgets.read().get(&user_id).copied())
    }
}
