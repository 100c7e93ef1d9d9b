// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Billing: snapshot persistence with incremental aggregate upkeep, budget
//! checks and month-to-date summaries.

use chrono::{DateTime, Utc};
use metrics::histogram;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::billing::{
    AggregationPeriod, AggregationScope, BillingSummary, BudgetCheck, HiringUsage, RateCard,
    ResourceSnapshot, UsageAggregation,
};
use crate::domain::error::OrchestrationError;
use crate::domain::hiring::{HiringId, UserId};
use crate::domain::repository::{HiringRepository, SnapshotQuery, UsageRepository};

pub struct BillingService {
    usage: Arc<dyn UsageRepository>,
    hirings: Arc<dyn HiringRepository>,
    rates: RateCard,
    default_monthly_budget: Option<f64>,
}

impl BillingService {
    pub fn new(
        usage: Arc<dyn UsageRepository>,
        hirings: Arc<dyn HiringRepository>,
        rates: RateCard,
        default_monthly_budget: Option<f64>,
    ) -> Self {
        Self {
            usage,
            hirings,
            rates,
            default_monthly_budget,
        }
    }

    pub fn rates(&self) -> RateCard {
        self.rates
    }

    /// Stores a snapshot and refreshes every aggregate window it falls in.
    pub async fn record_snapshot(
        &self,
        snapshot: &ResourceSnapshot,
    ) -> Result<(), OrchestrationError> {
        self.usage.insert_snapshot(snapshot).await?;
        histogram!("aghub_snapshot_cost_usd").record(snapshot.total_cost());

        let scopes = [
            AggregationScope::Deployment(snapshot.deployment_id.clone()),
            AggregationScope::User(snapshot.user_id),
        ];
        for scope in scopes {
            for period in AggregationPeriod::ALL {
                self.recompute_aggregation(scope.clone(), period, snapshot.collected_at)
                    .await?;
            }
        }
        Ok(())
    }

    /// Rebuilds the `(scope, period)` window containing `at` from its
    /// snapshots and upserts it. Safe to repeat.
    pub async fn recompute_aggregation(
        &self,
        scope: AggregationScope,
        period: AggregationPeriod,
        at: DateTime<Utc>,
    ) -> Result<UsageAggregation, OrchestrationError> {
        let start = period.bucket_start(at);
        let end = period.bucket_end(start);
        let snapshots = self
            .usage
            .list_snapshots(&SnapshotQuery::for_window(&scope, start, end))
            .await?;
        let executions = match &scope {
            AggregationScope::User(user_id) => self.usage.list_execution_usage(*user_id, start, end).await?,
            AggregationScope::Deployment(_) => Vec::new(),
        };

        let aggregation = UsageAggregation::recompute(scope, period, at, &snapshots, &executions);
        self.usage.upsert_aggregation(&aggregation).await?;
        debug!(
            scope = aggregation.scope.kind(),
            key = %aggregation.scope.key(),
            period = %period,
            total = aggregation.total_cost,
            "Aggregation refreshed"
        );
        Ok(aggregation)
    }

    /// User's own budget, else the configured default.
    pub async fn monthly_budget(&self, user_id: UserId) -> Result<Option<f64>, OrchestrationError> {
        Ok(self
            .usage
            .monthly_budget(user_id)
            .await?
            .or(self.default_monthly_budget))
    }

    pub async fn set_monthly_budget(
        &self,
        user_id: UserId,
        budget: Option<f64>,
    ) -> Result<(), OrchestrationError> {
        if let Some(limit) = budget {
            if !limit.is_finite() || limit < 0.0 {
                return Err(OrchestrationError::Validation(format!(
                    "Monthly budget must be a non-negative amount, got {}",
                    limit
                )));
            }
        }
        self.usage.set_monthly_budget(user_id, budget).await?;
        info!(user_id = %user_id, budget = ?budget, "Monthly budget updated");
        Ok(())
    }

    /// Cost accrued by `user_id` in the UTC month containing `now`, external
    /// invocation cost included.
    pub async fn accrued_this_month(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<f64, OrchestrationError> {
        let aggregation = self
            .recompute_aggregation(AggregationScope::User(user_id), AggregationPeriod::Monthly, now)
            .await?;
        Ok(aggregation.total_cost)
    }

    pub async fn check_budget(
        &self,
        user_id: UserId,
        estimate: f64,
    ) -> Result<BudgetCheck, OrchestrationError> {
        if !estimate.is_finite() || estimate < 0.0 {
            return Err(OrchestrationError::Validation(format!(
                "Cost estimate must be a non-negative amount, got {}",
                estimate
            )));
        }
        let accrued = self.accrued_this_month(user_id, Utc::now()).await?;
        let budget = self.monthly_budget(user_id).await?;
        Ok(BudgetCheck::evaluate(accrued, estimate, budget))
    }

    /// Like [`check_budget`](Self::check_budget) but turns a refusal into
    /// `ResourceExhausted`.
    pub async fn ensure_within_budget(
        &self,
        user_id: UserId,
        estimate: f64,
    ) -> Result<BudgetCheck, OrchestrationError> {
        let check = self.check_budget(user_id, estimate).await?;
        if !check.allowed {
            return Err(OrchestrationError::ResourceExhausted(format!(
                "Monthly budget of ${:.2} would be exceeded: ${:.4} accrued, ${:.4} estimated",
                check.budget.unwrap_or_default(),
                check.accrued,
                check.estimate
            )));
        }
        Ok(check)
    }

    pub async fn hiring_usage(
        &self,
        hiring_id: HiringId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<HiringUsage, OrchestrationError> {
        let hiring = self
            .hirings
            .find_by_id(hiring_id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("Hiring", hiring_id))?;
        let snapshots = self
            .usage
            .list_snapshots(&SnapshotQuery {
                hiring_id: Some(hiring_id),
                from: Some(from),
                until: Some(until),
                ..Default::default()
            })
            .await?;
        let executions = self.usage.list_execution_usage(hiring.user_id, from, until).await?;
        Ok(HiringUsage::compute(hiring_id, &snapshots, &executions))
    }

    /// Month-to-date totals for `user_id` with a per-hiring breakdown.
    pub async fn billing_summary(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<BillingSummary, OrchestrationError> {
        let period = AggregationPeriod::Monthly;
        let period_start = period.bucket_start(now);
        let period_end = period.bucket_end(period_start);

        let snapshots = self
            .usage
            .list_snapshots(&SnapshotQuery {
                user_id: Some(user_id),
                from: Some(period_start),
                until: Some(period_end),
                ..Default::default()
            })
            .await?;
        let executions = self
            .usage
            .list_execution_usage(user_id, period_start, period_end)
            .await?;

        let mut hiring_ids: BTreeSet<HiringId> = self
            .hirings
            .list_by_user(user_id)
            .await?
            .into_iter()
            .map(|h| h.id)
            .collect();
        hiring_ids.extend(snapshots.iter().map(|s| s.hiring_id));
        hiring_ids.extend(executions.iter().map(|u| u.hiring_id));

        let hirings: Vec<HiringUsage> = hiring_ids
            .into_iter()
            .map(|id| HiringUsage::compute(id, &snapshots, &executions))
            .collect();
        let accrued = hirings.iter().map(|h| h.total_cost).sum::<f64>();
        let budget = self.monthly_budget(user_id).await?;
        let check = BudgetCheck::evaluate(accrued, 0.0, budget);

        Ok(BillingSummary {
            user_id,
            period_start,
            period_end,
            accrued,
            budget,
            remaining: check.remaining,
            hirings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentId;
    use crate::domain::billing::{ExecutionUsage, MetricAccuracy, SnapshotMetrics, UsageOperation};
    use crate::domain::deployment::DeploymentId;
    use crate::domain::execution::ExecutionId;
    use crate::domain::hiring::NewHiring;
    use crate::infrastructure::repositories::{InMemoryHiringRepository, InMemoryUsageRepository};
    use chrono::TimeZone;
    use std::time::Duration;

    fn service(
        default_budget: Option<f64>,
    ) -> (BillingService, Arc<InMemoryUsageRepository>, Arc<InMemoryHiringRepository>) {
        let usage = Arc::new(InMemoryUsageRepository::new());
        let hirings = Arc::new(InMemoryHiringRepository::new());
        let rates = RateCard {
            cpu_per_vcpu_hour: 4.16,
            memory_per_gb_hour: 0.56,
            network_per_gb: 0.0,
            storage_per_gb_month: 0.0,
        };
        (
            BillingService::new(usage.clone(), hirings.clone(), rates, default_budget),
            usage,
            hirings,
        )
    }

    fn snapshot(service: &BillingService, at: DateTime<Utc>, hiring: i64) -> ResourceSnapshot {
        ResourceSnapshot::new(
            DeploymentId("func-user-1-agent-a-hire-1-00000000".to_string()),
            HiringId(hiring),
            UserId(1),
            at,
            Duration::from_secs(30),
            SnapshotMetrics {
                cpu_percent: 50.0,
                memory_bytes: 1024 * 1024 * 1024,
                ..Default::default()
            },
            MetricAccuracy::Exact,
            service.rates(),
        )
    }

    #[tokio::test]
    async fn test_recompute_is_idempotent() {
        let (service, _, _) = service(None);
        let hour = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        for i in 0..10 {
            service
                .record_snapshot(&snapshot(&service, hour + chrono::Duration::seconds(30 * i), 1))
                .await
                .unwrap();
        }

        let scope = AggregationScope::User(UserId(1));
        let first = service
            .recompute_aggregation(scope.clone(), AggregationPeriod::Hourly, hour)
            .await
            .unwrap();
        let second = service
            .recompute_aggregation(scope, AggregationPeriod::Hourly, hour)
            .await
            .unwrap();
        assert_eq!(first.snapshot_count, 10);
        assert!((first.total_cost - second.total_cost).abs() < 1e-12);
        assert!((first.total_cost - 0.22).abs() < 1e-6, "got {}", first.total_cost);
    }

    #[tokio::test]
    async fn test_budget_refusal_reports_headroom() {
        let (service, _, _) = service(Some(1.0));
        let now = Utc::now();
        for i in 0..4 {
            service
                .record_snapshot(&snapshot(&service, now - chrono::Duration::seconds(30 * i), 1))
                .await
                .unwrap();
        }

        let check = service.check_budget(UserId(1), 0.5).await.unwrap();
        assert!(check.allowed);
        assert!((check.remaining.unwrap() - (1.0 - check.accrued)).abs() < 1e-9);

        let err = service.ensure_within_budget(UserId(1), 5.0).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ResourceExhausted(_)));

        service.set_monthly_budget(UserId(1), Some(0.01)).await.unwrap();
        let check = service.check_budget(UserId(1), 0.0).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.remaining, Some(0.0));

        assert!(service.set_monthly_budget(UserId(1), Some(-1.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_summary_merges_external_cost_per_hiring() {
        let (service, usage, hirings) = service(None);
        let hiring = hirings
            .create(NewHiring::new(UserId(1), AgentId::new("ABC123")))
            .await
            .unwrap();
        let now = Utc::now();
        service.record_snapshot(&snapshot(&service, now, hiring.id.0)).await.unwrap();

        let mut record = ExecutionUsage::start(ExecutionId::new(), hiring.id, UserId(1));
        record.operations.push(UsageOperation::new("llm", 10, 10, 0.5));
        record.finish(crate::domain::execution::ExecutionStatus::Completed);
        usage.save_execution_usage(&record).await.unwrap();

        let summary = service.billing_summary(UserId(1), now).await.unwrap();
        assert_eq!(summary.hirings.len(), 1);
        let entry = &summary.hirings[0];
        assert_eq!(entry.execution_count, 1);
        assert!((entry.external_cost - 0.5).abs() < 1e-9);
        assert!((summary.accrued - entry.total_cost).abs() < 1e-9);
        assert_eq!(summary.remaining, None);
    }
}
