// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Agent Repository
//!
//! `AgentRepository` backed by the `agents` table. Schema, requirements and
//! source files are stored as JSONB documents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::agent::{Agent, AgentId, ApprovalStatus, ExecutionModel};
use crate::domain::hiring::UserId;
use crate::domain::repository::{AgentRepository, RepositoryError};

pub struct PostgresAgentRepository {
    pool: PgPool,
}

impl PostgresAgentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<Agent, RepositoryError> {
        let model: String = row.get("execution_model");
        let approval: String = row.get("approval_status");
        let created_at: DateTime<Utc> = row.get("created_at");

        Ok(Agent {
            id: AgentId(row.get("id")),
            version: row.get("version"),
            name: row.get("name"),
            creator_id: UserId(row.get("creator_id")),
            execution_model: ExecutionModel::parse(&model).ok_or_else(|| {
                RepositoryError::Serialization(format!("Unknown execution model '{}'", model))
            })?,
            entry_point: row.get("entry_point"),
            io_schema: serde_json::from_value(row.get("io_schema"))?,
            requirements: serde_json::from_value(row.get("requirements"))?,
            files: serde_json::from_value(row.get("files"))?,
            approval_status: ApprovalStatus::parse(&approval).ok_or_else(|| {
                RepositoryError::Serialization(format!("Unknown approval status '{}'", approval))
            })?,
            created_at,
        })
    }
}

const SELECT_AGENT: &str = r#"
    SELECT id, version, name, creator_id, execution_model, entry_point,
           io_schema, requirements, files, approval_status, created_at
    FROM agents
"#;

#[async_trait]
impl AgentRepository for PostgresAgentRepository {
    async fn save(&self, agent: &Agent) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO agents (
                id, version, name, creator_id, execution_model, entry_point,
                io_schema, requirements, files, approval_status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                version = EXCLUDED.version,
                name = EXCLUDED.name,
                execution_model = EXCLUDED.execution_model,
                entry_point = EXCLUDED.entry_point,
                io_schema = EXCLUDED.io_schema,
                requirements = EXCLUDED.requirements,
                files = EXCLUDED.files,
                approval_status = EXCLUDED.approval_status
            "#,
        )
        .bind(agent.id.as_str())
        .bind(&agent.version)
        .bind(&agent.name)
        .bind(agent.creator_id.0)
        .bind(agent.execution_model.as_str())
        .bind(&agent.entry_point)
        .bind(serde_json::to_value(&agent.io_schema)?)
        .bind(serde_json::to_value(&agent.requirements)?)
        .bind(serde_json::to_value(&agent.files)?)
        .bind(agent.approval_status.as_str())
        .bind(agent.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save agent: {}", e)))?;

        Ok(())
    }

    async fn find_by_id(&self, id: &AgentId) -> Result<Option<Agent>, RepositoryError> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_AGENT))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_all(&self) -> Result<Vec<Agent>, RepositoryError> {
        let rows = sqlx::query(&format!("{} ORDER BY id ASC", SELECT_AGENT))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::map_row).collect()
    }
}
