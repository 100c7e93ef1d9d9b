// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Execution Repository
//!
//! `transition` is a conditional `UPDATE ... WHERE status = $expected`, so two
//! writers racing to finish the same execution cannot both win.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::str::FromStr;

use crate::domain::agent::AgentId;
use crate::domain::execution::{Execution, ExecutionId, ExecutionStatus, ExecutionType};
use crate::domain::hiring::{HiringId, UserId};
use crate::domain::repository::{ExecutionRepository, RepositoryError};

pub struct PostgresExecutionRepository {
    pool: PgPool,
}

impl PostgresExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<Execution, RepositoryError> {
        let execution_type: String = row.get("execution_type");
        let status: String = row.get("status");
        let duration_ms: Option<i64> = row.get("duration_ms");
        let usage: Option<serde_json::Value> = row.get("usage");

        Ok(Execution {
            id: ExecutionId(row.get("id")),
            hiring_id: HiringId(row.get("hiring_id")),
            user_id: UserId(row.get("user_id")),
            agent_id: AgentId(row.get("agent_id")),
            execution_type: ExecutionType::from_str(&execution_type)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
            status: ExecutionStatus::parse(&status).ok_or_else(|| {
                RepositoryError::Serialization(format!("Unknown execution status '{}'", status))
            })?,
            input: row.get("input"),
            output: row.get("output"),
            error_message: row.get("error_message"),
            logs: serde_json::from_value(row.get("logs"))?,
            duration_ms: duration_ms.map(|ms| ms.max(0) as u64),
            usage: usage.map(serde_json::from_value).transpose()?,
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

const SELECT_EXECUTION: &str = r#"
    SELECT id, hiring_id, user_id, agent_id, execution_type, status, input, output,
           error_message, logs, duration_ms, usage, created_at, started_at, completed_at
    FROM executions
"#;

#[async_trait]
impl ExecutionRepository for PostgresExecutionRepository {
    async fn save(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let usage = execution.usage.as_ref().map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO executions (
                id, hiring_id, user_id, agent_id, execution_type, status, input, output,
                error_message, logs, duration_ms, usage, created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                output = EXCLUDED.output,
                error_message = EXCLUDED.error_message,
                logs = EXCLUDED.logs,
                duration_ms = EXCLUDED.duration_ms,
                usage = EXCLUDED.usage,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(execution.id.0)
        .bind(execution.hiring_id.0)
        .bind(execution.user_id.0)
        .bind(execution.agent_id.as_str())
        .bind(execution.execution_type.as_str())
        .bind(execution.status.as_str())
        .bind(&execution.input)
        .bind(&execution.output)
        .bind(&execution.error_message)
        .bind(serde_json::to_value(&execution.logs)?)
        .bind(execution.duration_ms.map(|ms| ms as i64))
        .bind(usage)
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> Result<bool, RepositoryError> {
        let usage = execution.usage.as_ref().map(serde_json::to_value).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE executions SET
                status = $3,
                output = $4,
                error_message = $5,
                logs = $6,
                duration_ms = $7,
                usage = $8,
                started_at = $9,
                completed_at = $10
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(execution.id.0)
        .bind(expected.as_str())
        .bind(execution.status.as_str())
        .bind(&execution.output)
        .bind(&execution.error_message)
        .bind(serde_json::to_value(&execution.logs)?)
        .bind(execution.duration_ms.map(|ms| ms as i64))
        .bind(usage)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM executions WHERE id = $1")
            .bind(execution.id.0)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("execution {}", execution.id))),
        }
    }

    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_EXECUTION))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_by_hiring(&self, hiring_id: HiringId) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!("{} WHERE hiring_id = $1 ORDER BY created_at", SELECT_EXECUTION))
            .bind(hiring_id.0)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::map_row).collect()
    }
}
