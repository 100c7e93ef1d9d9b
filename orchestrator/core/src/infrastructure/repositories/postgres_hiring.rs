// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Hiring Repository
//!
//! Hirings are never deleted; cancellation and expiry are status changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::agent::AgentId;
use crate::domain::hiring::{BillingCycle, Hiring, HiringId, HiringStatus, NewHiring, UserId};
use crate::domain::repository::{HiringRepository, RepositoryError};

pub struct PostgresHiringRepository {
    pool: PgPool,
}

impl PostgresHiringRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<Hiring, RepositoryError> {
        let status: String = row.get("status");
        let cycle: String = row.get("billing_cycle");

        Ok(Hiring {
            id: HiringId(row.get("id")),
            user_id: UserId(row.get("user_id")),
            agent_id: AgentId(row.get("agent_id")),
            status: HiringStatus::parse(&status).ok_or_else(|| {
                RepositoryError::Serialization(format!("Unknown hiring status '{}'", status))
            })?,
            billing_cycle: BillingCycle::parse(&cycle).ok_or_else(|| {
                RepositoryError::Serialization(format!("Unknown billing cycle '{}'", cycle))
            })?,
            config: row.get("config"),
            hired_at: row.get("hired_at"),
            updated_at: row.get("updated_at"),
            suspended_at: row.get("suspended_at"),
            cancelled_at: row.get("cancelled_at"),
            expires_at: row.get("expires_at"),
        })
    }
}

const SELECT_HIRING: &str = r#"
    SELECT id, user_id, agent_id, status, billing_cycle, config,
           hired_at, updated_at, suspended_at, cancelled_at, expires_at
    FROM hirings
"#;

#[async_trait]
impl HiringRepository for PostgresHiringRepository {
    async fn create(&self, request: NewHiring) -> Result<Hiring, RepositoryError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO hirings (user_id, agent_id, status, billing_cycle, config, hired_at, updated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6, $7)
            RETURNING id
            "#,
        )
        .bind(request.user_id.0)
        .bind(request.agent_id.as_str())
        .bind(HiringStatus::Active.as_str())
        .bind(request.billing_cycle.as_str())
        .bind(&request.config)
        .bind(now)
        .bind(request.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to create hiring: {}", e)))?;

        let mut hiring = Hiring::from_request(HiringId(row.get("id")), request);
        hiring.hired_at = now;
        hiring.updated_at = now;
        Ok(hiring)
    }

    async fn save(&self, hiring: &Hiring) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE hirings SET
                status = $2,
                billing_cycle = $3,
                config = $4,
                updated_at = $5,
                suspended_at = $6,
                cancelled_at = $7,
                expires_at = $8
            WHERE id = $1
            "#,
        )
        .bind(hiring.id.0)
        .bind(hiring.status.as_str())
        .bind(hiring.billing_cycle.as_str())
        .bind(&hiring.config)
        .bind(hiring.updated_at)
        .bind(hiring.suspended_at)
        .bind(hiring.cancelled_at)
        .bind(hiring.expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("hiring {}", hiring.id)));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: HiringId) -> Result<Option<Hiring>, RepositoryError> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_HIRING))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_by_agent(&self, agent_id: &AgentId) -> Result<Vec<Hiring>, RepositoryError> {
        let rows = sqlx::query(&format!("{} WHERE agent_id = $1 ORDER BY id", SELECT_HIRING))
            .bind(agent_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Hiring>, RepositoryError> {
        let rows = sqlx::query(&format!("{} WHERE user_id = $1 ORDER BY id", SELECT_HIRING))
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Hiring>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= $1 ORDER BY id",
            SELECT_HIRING
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_row).collect()
    }
}
