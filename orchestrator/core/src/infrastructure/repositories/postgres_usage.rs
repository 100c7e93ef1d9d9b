// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Usage Repository
//!
//! Snapshots are insert-only. Aggregates are keyed by
//! `(scope_kind, scope_key, period, period_start)` and replaced on upsert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::domain::billing::{
    AggregationPeriod, AggregationScope, CostBreakdown, ExecutionUsage, MetricAccuracy,
    ResourceSnapshot, SnapshotMetrics, UsageAggregation,
};
use crate::domain::deployment::DeploymentId;
use crate::domain::execution::{ExecutionId, ExecutionStatus};
use crate::domain::hiring::{HiringId, UserId};
use crate::domain::repository::{RepositoryError, SnapshotQuery, UsageRepository};

pub struct PostgresUsageRepository {
    pool: PgPool,
}

impl PostgresUsageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_snapshot(row: &PgRow) -> Result<ResourceSnapshot, RepositoryError> {
        let accuracy: String = row.get("accuracy");
        let interval_seconds: i64 = row.get("interval_seconds");
        let bytes = |column: &str| row.get::<i64, _>(column).max(0) as u64;

        Ok(ResourceSnapshot {
            id: row.get("id"),
            deployment_id: DeploymentId(row.get("deployment_id")),
            hiring_id: HiringId(row.get("hiring_id")),
            user_id: UserId(row.get("user_id")),
            collected_at: row.get("collected_at"),
            interval_seconds: interval_seconds.max(0) as u64,
            metrics: SnapshotMetrics {
                cpu_percent: row.get("cpu_percent"),
                memory_bytes: bytes("memory_bytes"),
                network_bytes: bytes("network_bytes"),
                block_read_bytes: bytes("block_read_bytes"),
                block_write_bytes: bytes("block_write_bytes"),
                storage_bytes: bytes("storage_bytes"),
            },
            accuracy: MetricAccuracy::parse(&accuracy).ok_or_else(|| {
                RepositoryError::Serialization(format!("Unknown accuracy '{}'", accuracy))
            })?,
            rates: serde_json::from_value(row.get("rates"))?,
            cost: CostBreakdown {
                cpu: row.get("cpu_cost"),
                memory: row.get("memory_cost"),
                network: row.get("network_cost"),
                storage: row.get("storage_cost"),
            },
        })
    }

    fn map_execution_usage(row: &PgRow) -> Result<ExecutionUsage, RepositoryError> {
        let outcome: Option<String> = row.get("outcome");
        Ok(ExecutionUsage {
            execution_id: ExecutionId(row.get("execution_id")),
            hiring_id: HiringId(row.get("hiring_id")),
            user_id: UserId(row.get("user_id")),
            started_at: row.get("started_at"),
            ended_at: row.get("ended_at"),
            outcome: outcome.as_deref().and_then(ExecutionStatus::parse),
            operations: serde_json::from_value(row.get("operations"))?,
        })
    }
}

fn to_db_bytes(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

#[async_trait]
impl UsageRepository for PostgresUsageRepository {
    async fn insert_snapshot(&self, snapshot: &ResourceSnapshot) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO resource_snapshots (
                id, deployment_id, hiring_id, user_id, collected_at, interval_seconds,
                cpu_percent, memory_bytes, network_bytes, block_read_bytes, block_write_bytes,
                storage_bytes, accuracy, rates, cpu_cost, memory_cost, network_cost, storage_cost
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.deployment_id.as_str())
        .bind(snapshot.hiring_id.0)
        .bind(snapshot.user_id.0)
        .bind(snapshot.collected_at)
        .bind(to_db_bytes(snapshot.interval_seconds))
        .bind(snapshot.metrics.cpu_percent)
        .bind(to_db_bytes(snapshot.metrics.memory_bytes))
        .bind(to_db_bytes(snapshot.metrics.network_bytes))
        .bind(to_db_bytes(snapshot.metrics.block_read_bytes))
        .bind(to_db_bytes(snapshot.metrics.block_write_bytes))
        .bind(to_db_bytes(snapshot.metrics.storage_bytes))
        .bind(snapshot.accuracy.as_str())
        .bind(serde_json::to_value(snapshot.rates)?)
        .bind(snapshot.cost.cpu)
        .bind(snapshot.cost.memory)
        .bind(snapshot.cost.network)
        .bind(snapshot.cost.storage)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_snapshots(
        &self,
        query: &SnapshotQuery,
    ) -> Result<Vec<ResourceSnapshot>, RepositoryError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            SELECT id, deployment_id, hiring_id, user_id, collected_at, interval_seconds,
                   cpu_percent, memory_bytes, network_bytes, block_read_bytes, block_write_bytes,
                   storage_bytes, accuracy, rates, cpu_cost, memory_cost, network_cost, storage_cost
            FROM resource_snapshots WHERE TRUE
            "#,
        );
        if let Some(id) = &query.deployment_id {
            builder.push(" AND deployment_id = ").push_bind(id.0.clone());
        }
        if let Some(id) = query.hiring_id {
            builder.push(" AND hiring_id = ").push_bind(id.0);
        }
        if let Some(id) = query.user_id {
            builder.push(" AND user_id = ").push_bind(id.0);
        }
        if let Some(from) = query.from {
            builder.push(" AND collected_at >= ").push_bind(from);
        }
        if let Some(until) = query.until {
            builder.push(" AND collected_at < ").push_bind(until);
        }
        builder.push(" ORDER BY collected_at");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::map_snapshot).collect()
    }

    async fn upsert_aggregation(
        &self,
        aggregation: &UsageAggregation,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO usage_aggregations (
                scope_kind, scope_key, period, period_start, period_end, snapshot_count,
                cpu_cost, memory_cost, network_cost, storage_cost, external_cost, total_cost, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (scope_kind, scope_key, period, period_start) DO UPDATE SET
                period_end = EXCLUDED.period_end,
                snapshot_count = EXCLUDED.snapshot_count,
                cpu_cost = EXCLUDED.cpu_cost,
                memory_cost = EXCLUDED.memory_cost,
                network_cost = EXCLUDED.network_cost,
                storage_cost = EXCLUDED.storage_cost,
                external_cost = EXCLUDED.external_cost,
                total_cost = EXCLUDED.total_cost,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(aggregation.scope.kind())
        .bind(aggregation.scope.key())
        .bind(aggregation.period.as_str())
        .bind(aggregation.period_start)
        .bind(aggregation.period_end)
        .bind(to_db_bytes(aggregation.snapshot_count))
        .bind(aggregation.cost.cpu)
        .bind(aggregation.cost.memory)
        .bind(aggregation.cost.network)
        .bind(aggregation.cost.storage)
        .bind(aggregation.external_cost)
        .bind(aggregation.total_cost)
        .bind(aggregation.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_aggregation(
        &self,
        scope: &AggregationScope,
        period: AggregationPeriod,
        period_start: DateTime<Utc>,
    ) -> Result<Option<UsageAggregation>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT period_end, snapshot_count, cpu_cost, memory_cost, network_cost,
                   storage_cost, external_cost, total_cost, updated_at
            FROM usage_aggregations
            WHERE scope_kind = $1 AND scope_key = $2 AND period = $3 AND period_start = $4
            "#,
        )
        .bind(scope.kind())
        .bind(scope.key())
        .bind(period.as_str())
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let snapshot_count: i64 = row.get("snapshot_count");
            UsageAggregation {
                scope: scope.clone(),
                period,
                period_start,
                period_end: row.get("period_end"),
                snapshot_count: snapshot_count.max(0) as u64,
                cost: CostBreakdown {
                    cpu: row.get("cpu_cost"),
                    memory: row.get("memory_cost"),
                    network: row.get("network_cost"),
                    storage: row.get("storage_cost"),
                },
                external_cost: row.get("external_cost"),
                total_cost: row.get("total_cost"),
                updated_at: row.get("updated_at"),
            }
        }))
    }

    async fn save_execution_usage(&self, usage: &ExecutionUsage) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO execution_usage (execution_id, hiring_id, user_id, started_at, ended_at, outcome, operations)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (execution_id) DO UPDATE SET
                ended_at = EXCLUDED.ended_at,
                outcome = EXCLUDED.outcome,
                operations = EXCLUDED.operations
            "#,
        )
        .bind(usage.execution_id.0)
        .bind(usage.hiring_id.0)
        .bind(usage.user_id.0)
        .bind(usage.started_at)
        .bind(usage.ended_at)
        .bind(usage.outcome.map(|s| s.as_str()))
        .bind(serde_json::to_value(&usage.operations)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_execution_usage(
        &self,
        id: ExecutionId,
    ) -> Result<Option<ExecutionUsage>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT execution_id, hiring_id, user_id, started_at, ended_at, outcome, operations
            FROM execution_usage WHERE execution_id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::map_execution_usage).transpose()
    }

    async fn list_execution_usage(
        &self,
        user_id: UserId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ExecutionUsage>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, hiring_id, user_id, started_at, ended_at, outcome, operations
            FROM execution_usage
            WHERE user_id = $1 AND started_at >= $2 AND started_at < $3
            ORDER BY started_at
            "#,
        )
        .bind(user_id.0)
        .bind(from)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_execution_usage).collect()
    }

    async fn set_monthly_budget(
        &self,
        user_id: UserId,
        budget: Option<f64>,
    ) -> Result<(), RepositoryError> {
        match budget {
            Some(amount) => {
                sqlx::query(
                    r#"
                    INSERT INTO user_budgets (user_id, monthly_budget, updated_at)
                    VALUES ($1, $2, now())
                    ON CONFLICT (user_id) DO UPDATE SET
                        monthly_budget = EXCLUDED.monthly_budget,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(user_id.0)
                .bind(amount)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM user_budgets WHERE user_id = $1")
                    .bind(user_id.0)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn monthly_budget(&self, user_id: UserId) -> Result<Option<f64>, RepositoryError> {
        let row = sqlx::query("SELECT monthly_budget FROM user_budgets WHERE user_id = $1")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get("monthly_budget")))
    }
}
