// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Creates concrete repository implementations based on storage backend
//! configuration, keeping the domain layer free of infrastructure types.

use std::sync::Arc;
use sqlx::PgPool;

use crate::domain::repository::{
    AgentRepository, DeploymentRepository, ExecutionRepository, HiringRepository,
    StorageBackend, UsageRepository,
};
use crate::infrastructure::repositories::postgres_agent::PostgresAgentRepository;
use crate::infrastructure::repositories::postgres_deployment::PostgresDeploymentRepository;
use crate::infrastructure::repositories::postgres_execution::PostgresExecutionRepository;
use crate::infrastructure::repositories::postgres_hiring::PostgresHiringRepository;
use crate::infrastructure::repositories::postgres_usage::PostgresUsageRepository;
use crate::infrastructure::repositories::{
    InMemoryAgentRepository, InMemoryDeploymentRepository, InMemoryExecutionRepository,
    InMemoryHiringRepository, InMemoryUsageRepository,
};

/// One handle per aggregate store, shared by every service.
#[derive(Clone)]
pub struct Repositories {
    pub agents: Arc<dyn AgentRepository>,
    pub hirings: Arc<dyn HiringRepository>,
    pub deployments: Arc<dyn DeploymentRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub usage: Arc<dyn UsageRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            agents: Arc::new(InMemoryAgentRepository::new()),
            hirings: Arc::new(InMemoryHiringRepository::new()),
            deployments: Arc::new(InMemoryDeploymentRepository::new()),
            executions: Arc::new(InMemoryExecutionRepository::new()),
            usage: Arc::new(InMemoryUsageRepository::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            agents: Arc::new(PostgresAgentRepository::new(pool.clone())),
            hirings: Arc::new(PostgresHiringRepository::new(pool.clone())),
            deployments: Arc::new(PostgresDeploymentRepository::new(pool.clone())),
            executions: Arc::new(PostgresExecutionRepository::new(pool.clone())),
            usage: Arc::new(PostgresUsageRepository::new(pool)),
        }
    }

    /// `pool` is only consulted for the PostgreSQL backend.
    pub fn for_backend(backend: &StorageBackend, pool: Option<PgPool>) -> Option<Self> {
        match (backend, pool) {
            (StorageBackend::InMemory, _) => Some(Self::in_memory()),
            (StorageBackend::PostgreSQL(_), Some(pool)) => Some(Self::postgres(pool)),
            (StorageBackend::PostgreSQL(_), None) => None,
        }
    }
}
