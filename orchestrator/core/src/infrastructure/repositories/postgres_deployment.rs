// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Deployment Repository
//!
//! Cancelled deployments stay in the table for audit. A partial unique index
//! on `external_port` over live statuses backs the port allocator: a save
//! that would share a host port with another live deployment fails with
//! `RepositoryError::Conflict`.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::domain::agent::{AgentId, ExecutionModel};
use crate::domain::deployment::{Deployment, DeploymentFlavor, DeploymentId, DeploymentStatus};
use crate::domain::hiring::{HiringId, UserId};
use crate::domain::repository::{DeploymentRepository, RepositoryError};

pub struct PostgresDeploymentRepository {
    pool: PgPool,
}

impl PostgresDeploymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<Deployment, RepositoryError> {
        let model: String = row.get("execution_model");
        let flavor: String = row.get("flavor");
        let status: String = row.get("status");
        let internal_port: Option<i32> = row.get("internal_port");
        let external_port: Option<i32> = row.get("external_port");
        let failures: i32 = row.get("health_check_failures");
        let uuid: Uuid = row.get("uuid");

        Ok(Deployment {
            id: DeploymentId(row.get("id")),
            uuid,
            hiring_id: HiringId(row.get("hiring_id")),
            user_id: UserId(row.get("user_id")),
            agent_id: AgentId(row.get("agent_id")),
            execution_model: ExecutionModel::parse(&model).ok_or_else(|| {
                RepositoryError::Serialization(format!("Unknown execution model '{}'", model))
            })?,
            flavor: match flavor.as_str() {
                "networked" => DeploymentFlavor::Networked,
                "headless" => DeploymentFlavor::Headless,
                other => {
                    return Err(RepositoryError::Serialization(format!(
                        "Unknown deployment flavor '{}'",
                        other
                    )))
                }
            },
            container_id: row.get("container_id"),
            container_name: row.get("container_name"),
            image_name: row.get("image_name"),
            internal_port: internal_port.map(port_from_db).transpose()?,
            external_port: external_port.map(port_from_db).transpose()?,
            status: DeploymentStatus::parse(&status).ok_or_else(|| {
                RepositoryError::Serialization(format!("Unknown deployment status '{}'", status))
            })?,
            is_healthy: row.get("is_healthy"),
            health_check_failures: failures.max(0) as u32,
            last_health_check: row.get("last_health_check"),
            error_message: row.get("error_message"),
            logs: serde_json::from_value(row.get("logs"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            started_at: row.get("started_at"),
            stopped_at: row.get("stopped_at"),
        })
    }
}

fn port_from_db(port: i32) -> Result<u16, RepositoryError> {
    u16::try_from(port).map_err(|_| RepositoryError::Serialization(format!("Invalid port {}", port)))
}

fn flavor_str(flavor: DeploymentFlavor) -> &'static str {
    match flavor {
        DeploymentFlavor::Networked => "networked",
        DeploymentFlavor::Headless => "headless",
    }
}

const SELECT_DEPLOYMENT: &str = r#"
    SELECT id, uuid, hiring_id, user_id, agent_id, execution_model, flavor,
           container_id, container_name, image_name, internal_port, external_port,
           status, is_healthy, health_check_failures, last_health_check,
           error_message, logs, created_at, updated_at, started_at, stopped_at
    FROM deployments
"#;

#[async_trait]
impl DeploymentRepository for PostgresDeploymentRepository {
    async fn save(&self, deployment: &Deployment) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, uuid, hiring_id, user_id, agent_id, execution_model, flavor,
                container_id, container_name, image_name, internal_port, external_port,
                status, is_healthy, health_check_failures, last_health_check,
                error_message, logs, created_at, updated_at, started_at, stopped_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (id) DO UPDATE SET
                container_id = EXCLUDED.container_id,
                internal_port = EXCLUDED.internal_port,
                external_port = EXCLUDED.external_port,
                status = EXCLUDED.status,
                is_healthy = EXCLUDED.is_healthy,
                health_check_failures = EXCLUDED.health_check_failures,
                last_health_check = EXCLUDED.last_health_check,
                error_message = EXCLUDED.error_message,
                logs = EXCLUDED.logs,
                updated_at = EXCLUDED.updated_at,
                started_at = EXCLUDED.started_at,
                stopped_at = EXCLUDED.stopped_at
            "#,
        )
        .bind(deployment.id.as_str())
        .bind(deployment.uuid)
        .bind(deployment.hiring_id.0)
        .bind(deployment.user_id.0)
        .bind(deployment.agent_id.as_str())
        .bind(deployment.execution_model.as_str())
        .bind(flavor_str(deployment.flavor))
        .bind(&deployment.container_id)
        .bind(&deployment.container_name)
        .bind(&deployment.image_name)
        .bind(deployment.internal_port.map(i32::from))
        .bind(deployment.external_port.map(i32::from))
        .bind(deployment.status.as_str())
        .bind(deployment.is_healthy)
        .bind(deployment.health_check_failures.min(i32::MAX as u32) as i32)
        .bind(deployment.last_health_check)
        .bind(&deployment.error_message)
        .bind(serde_json::to_value(&deployment.logs)?)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .bind(deployment.started_at)
        .bind(deployment.stopped_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition(
        &self,
        deployment: &Deployment,
        expected: DeploymentStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE deployments SET
                container_id = $3,
                internal_port = $4,
                external_port = $5,
                status = $6,
                is_healthy = $7,
                health_check_failures = $8,
                last_health_check = $9,
                error_message = $10,
                logs = $11,
                updated_at = $12,
                started_at = $13,
                stopped_at = $14
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(deployment.id.as_str())
        .bind(expected.as_str())
        .bind(&deployment.container_id)
        .bind(deployment.internal_port.map(i32::from))
        .bind(deployment.external_port.map(i32::from))
        .bind(deployment.status.as_str())
        .bind(deployment.is_healthy)
        .bind(deployment.health_check_failures.min(i32::MAX as u32) as i32)
        .bind(deployment.last_health_check)
        .bind(&deployment.error_message)
        .bind(serde_json::to_value(&deployment.logs)?)
        .bind(deployment.updated_at)
        .bind(deployment.started_at)
        .bind(deployment.stopped_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM deployments WHERE id = $1")
            .bind(deployment.id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("deployment {}", deployment.id))),
        }
    }

    async fn find_by_id(&self, id: &DeploymentId) -> Result<Option<Deployment>, RepositoryError> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_DEPLOYMENT))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_by_hiring(
        &self,
        hiring_id: HiringId,
    ) -> Result<Option<Deployment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{} WHERE hiring_id = $1 ORDER BY created_at DESC LIMIT 1",
            SELECT_DEPLOYMENT
        ))
        .bind(hiring_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_by_status(
        &self,
        status: DeploymentStatus,
    ) -> Result<Vec<Deployment>, RepositoryError> {
        let rows = sqlx::query(&format!("{} WHERE status = $1 ORDER BY created_at", SELECT_DEPLOYMENT))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Deployment>, RepositoryError> {
        let rows = sqlx::query(&format!("{} WHERE user_id = $1 ORDER BY created_at", SELECT_DEPLOYMENT))
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn list_all(&self) -> Result<Vec<Deployment>, RepositoryError> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at", SELECT_DEPLOYMENT))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn ports_in_use(&self) -> Result<Vec<u16>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT external_port FROM deployments
            WHERE external_port IS NOT NULL
              AND status NOT IN ('stopped', 'failed', 'crashed', 'cancelled')
            ORDER BY external_port
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| port_from_db(row.get::<i32, _>("external_port")))
            .collect()
    }
}
