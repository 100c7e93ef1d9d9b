// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Resource Metering and Cost Model
//!
//! Converts raw container counters into dollar cost and rolls the resulting
//! [`ResourceSnapshot`]s up into [`UsageAggregation`] windows.
//!
//! Rates are per resource type and do not depend on the agent's execution
//! model:
//!
//! | Resource | Unit | Snapshot cost |
//! |----------|------|---------------|
//! | CPU | $/vCPU-hour | `vcpu × rate × interval / 3600` |
//! | Memory | $/GB-hour | `gb × rate × interval / 3600` |
//! | Network | $/GB transferred | `gb × rate` |
//! | Storage | $/GB-month | `gb × (rate / 730) × interval / 3600` |
//!
//! Aggregation windows use UTC wall-clock boundaries. Aggregates are always
//! recomputed from the full snapshot set of the window, so recomputation is
//! idempotent.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::deployment::DeploymentId;
use crate::domain::execution::{ExecutionId, ExecutionStatus};
use crate::domain::hiring::{HiringId, UserId};
use crate::domain::runtime::ContainerStats;

pub const HOURS_PER_MONTH: f64 = 730.0;
pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateCard {
    pub cpu_per_vcpu_hour: f64,
    pub memory_per_gb_hour: f64,
    pub network_per_gb: f64,
    pub storage_per_gb_month: f64,
}

impl Default for RateCard {
    fn default() -> Self {
        Self {
            cpu_per_vcpu_hour: 0.0416,
            memory_per_gb_hour: 0.0056,
            network_per_gb: 0.09,
            storage_per_gb_month: 0.10,
        }
    }
}

impl RateCard {
    pub fn storage_per_gb_hour(&self) -> f64 {
        self.storage_per_gb_month / HOURS_PER_MONTH
    }

    pub fn has_negative_rate(&self) -> bool {
        [
            self.cpu_per_vcpu_hour,
            self.memory_per_gb_hour,
            self.network_per_gb,
            self.storage_per_gb_month,
        ]
        .iter()
        .any(|rate| *rate < 0.0 || !rate.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricAccuracy {
    Exact,
    /// Host CPU counter was unavailable; CPU was derived from the container delta alone.
    Estimated,
}

impl MetricAccuracy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricAccuracy::Exact => "exact",
            MetricAccuracy::Estimated => "estimated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact" => Some(MetricAccuracy::Exact),
            "estimated" => Some(MetricAccuracy::Estimated),
            _ => None,
        }
    }
}

/// CPU utilisation in percent of one vCPU (200.0 = two cores saturated).
///
/// Uses `(container_delta / host_delta) × online_cpus × 100`. Without a host
/// counter the container delta is divided by the wall time between Docker's
/// `preread` and `read` samples, and only by `fallback_window` when those
/// timestamps are missing. Either way the result is [`MetricAccuracy::Estimated`].
pub fn cpu_percent(stats: &ContainerStats, fallback_window: Duration) -> (f64, MetricAccuracy) {
    let cpu_delta = stats.cpu_delta() as f64;
    match stats.system_delta() {
        Some(system_delta) => {
            let cpus = stats.online_cpus.max(1) as f64;
            ((cpu_delta / system_delta as f64) * cpus * 100.0, MetricAccuracy::Exact)
        }
        None => {
            let window = stats.sample_window().unwrap_or(fallback_window);
            let window_ns = window.as_secs_f64() * 1e9;
            if window_ns <= 0.0 {
                return (0.0, MetricAccuracy::Estimated);
            }
            ((cpu_delta / window_ns) * 100.0, MetricAccuracy::Estimated)
        }
    }
}

/// Measured quantities for one collection tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetrics {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    /// Bytes transferred since the previous tick.
    pub network_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub storage_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
    pub storage: f64,
}

impl CostBreakdown {
    pub fn compute(metrics: &SnapshotMetrics, rates: &RateCard, interval: Duration) -> Self {
        let hours = interval.as_secs_f64() / 3600.0;
        let vcpus = metrics.cpu_percent.max(0.0) / 100.0;
        let memory_gb = metrics.memory_bytes as f64 / BYTES_PER_GB;
        let network_gb = metrics.network_bytes as f64 / BYTES_PER_GB;
        let storage_gb = metrics.storage_bytes as f64 / BYTES_PER_GB;

        Self {
            cpu: vcpus * rates.cpu_per_vcpu_hour * hours,
            memory: memory_gb * rates.memory_per_gb_hour * hours,
            network: network_gb * rates.network_per_gb,
            storage: storage_gb * rates.storage_per_gb_hour() * hours,
        }
    }

    pub fn total(&self) -> f64 {
        self.cpu + self.memory + self.network + self.storage
    }

    fn add(&mut self, other: &CostBreakdown) {
        self.cpu += other.cpu;
        self.memory += other.memory;
        self.network += other.network;
        self.storage += other.storage;
    }
}

/// Bytes transferred between two cumulative counter reads. A counter that
/// went backwards means the container restarted; the new reading is the delta.
pub fn counter_delta(previous: Option<u64>, current: u64) -> u64 {
    match previous {
        Some(prev) if current >= prev => current - prev,
        Some(_) => current,
        None => 0,
    }
}

/// One write-once measurement of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: Uuid,
    pub deployment_id: DeploymentId,
    pub hiring_id: HiringId,
    pub user_id: UserId,
    pub collected_at: DateTime<Utc>,
    pub interval_seconds: u64,
    pub metrics: SnapshotMetrics,
    pub accuracy: MetricAccuracy,
    pub rates: RateCard,
    pub cost: CostBreakdown,
}

impl ResourceSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deployment_id: DeploymentId,
        hiring_id: HiringId,
        user_id: UserId,
        collected_at: DateTime<Utc>,
        interval: Duration,
        metrics: SnapshotMetrics,
        accuracy: MetricAccuracy,
        rates: RateCard,
    ) -> Self {
        let cost = CostBreakdown::compute(&metrics, &rates, interval);
        Self {
            id: Uuid::new_v4(),
            deployment_id,
            hiring_id,
            user_id,
            collected_at,
            interval_seconds: interval.as_secs(),
            metrics,
            accuracy,
            rates,
            cost,
        }
    }

    pub fn total_cost(&self) -> f64 {
        self.cost.total()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPeriod {
    Hourly,
    Daily,
    Monthly,
}

impl AggregationPeriod {
    pub const ALL: [AggregationPeriod; 3] = [
        AggregationPeriod::Hourly,
        AggregationPeriod::Daily,
        AggregationPeriod::Monthly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationPeriod::Hourly => "hourly",
            AggregationPeriod::Daily => "daily",
            AggregationPeriod::Monthly => "monthly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hourly" => Some(AggregationPeriod::Hourly),
            "daily" => Some(AggregationPeriod::Daily),
            "monthly" => Some(AggregationPeriod::Monthly),
            _ => None,
        }
    }

    /// Start of the UTC window containing `at`.
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = at.timestamp();
        match self {
            AggregationPeriod::Hourly => truncate_seconds(at, secs.rem_euclid(3600)),
            AggregationPeriod::Daily => truncate_seconds(at, secs.rem_euclid(86_400)),
            AggregationPeriod::Monthly => NaiveDate::from_ymd_opt(at.year(), at.month(), 1)
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
                .unwrap_or_else(|| AggregationPeriod::Daily.bucket_start(at)),
        }
    }

    /// Exclusive end of the window starting at `start`.
    pub fn bucket_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            AggregationPeriod::Hourly => start + ChronoDuration::hours(1),
            AggregationPeriod::Daily => start + ChronoDuration::days(1),
            AggregationPeriod::Monthly => start
                .checked_add_months(Months::new(1))
                .unwrap_or(start + ChronoDuration::days(31)),
        }
    }
}

fn truncate_seconds(at: DateTime<Utc>, remainder: i64) -> DateTime<Utc> {
    let base = at - ChronoDuration::seconds(remainder);
    base - ChronoDuration::nanoseconds(i64::from(base.timestamp_subsec_nanos()))
}

impl fmt::Display for AggregationPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AggregationScope {
    Deployment(DeploymentId),
    User(UserId),
}

impl AggregationScope {
    pub fn kind(&self) -> &'static str {
        match self {
            AggregationScope::Deployment(_) => "deployment",
            AggregationScope::User(_) => "user",
        }
    }

    pub fn key(&self) -> String {
        match self {
            AggregationScope::Deployment(id) => id.to_string(),
            AggregationScope::User(id) => id.to_string(),
        }
    }

    fn covers(&self, snapshot: &ResourceSnapshot) -> bool {
        match self {
            AggregationScope::Deployment(id) => &snapshot.deployment_id == id,
            AggregationScope::User(id) => snapshot.user_id == *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAggregation {
    pub scope: AggregationScope,
    pub period: AggregationPeriod,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub snapshot_count: u64,
    pub cost: CostBreakdown,
    /// Per-invocation cost tracked outside the container (user scope only).
    pub external_cost: f64,
    pub total_cost: f64,
    pub updated_at: DateTime<Utc>,
}

impl UsageAggregation {
    /// Recomputes the window containing `at` from scratch.
    pub fn recompute(
        scope: AggregationScope,
        period: AggregationPeriod,
        at: DateTime<Utc>,
        snapshots: &[ResourceSnapshot],
        executions: &[ExecutionUsage],
    ) -> Self {
        let period_start = period.bucket_start(at);
        let period_end = period.bucket_end(period_start);
        let in_window = |ts: DateTime<Utc>| ts >= period_start && ts < period_end;

        let mut cost = CostBreakdown::default();
        let mut snapshot_count = 0;
        for snapshot in snapshots
            .iter()
            .filter(|s| scope.covers(s) && in_window(s.collected_at))
        {
            cost.add(&snapshot.cost);
            snapshot_count += 1;
        }

        let external_cost = match &scope {
            AggregationScope::User(user_id) => executions
                .iter()
                .filter(|u| u.user_id == *user_id && in_window(u.started_at))
                .map(ExecutionUsage::external_cost)
                .sum(),
            AggregationScope::Deployment(_) => 0.0,
        };

        Self {
            total_cost: cost.total() + external_cost,
            scope,
            period,
            period_start,
            period_end,
            snapshot_count,
            cost,
            external_cost,
            updated_at: Utc::now(),
        }
    }
}

/// A single metered operation inside an execution (an LLM call, a paid API hit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageOperation {
    pub name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub recorded_at: DateTime<Utc>,
}

impl UsageOperation {
    pub fn new(name: impl Into<String>, input_tokens: u64, output_tokens: u64, cost: f64) -> Self {
        Self {
            name: name.into(),
            input_tokens,
            output_tokens,
            cost,
            recorded_at: Utc::now(),
        }
    }

    /// Reads an agent-reported `usage` object: `{input_tokens, output_tokens, cost}`.
    pub fn from_reported(name: &str, usage: &serde_json::Value) -> Option<Self> {
        let usage = usage.as_object()?;
        let tokens = |key: &str| usage.get(key).and_then(serde_json::Value::as_u64).unwrap_or(0);
        let cost = usage
            .get("cost")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0)
            .max(0.0);
        let op = Self::new(name, tokens("input_tokens"), tokens("output_tokens"), cost);
        if op.input_tokens == 0 && op.output_tokens == 0 && op.cost == 0.0 {
            return None;
        }
        Some(op)
    }
}

/// Usage bracket around one execution run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUsage {
    pub execution_id: ExecutionId,
    pub hiring_id: HiringId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<ExecutionStatus>,
    pub operations: Vec<UsageOperation>,
}

impl ExecutionUsage {
    pub fn start(execution_id: ExecutionId, hiring_id: HiringId, user_id: UserId) -> Self {
        Self {
            execution_id,
            hiring_id,
            user_id,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            operations: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn external_cost(&self) -> f64 {
        self.operations.iter().map(|op| op.cost).sum()
    }

    pub fn finish(&mut self, outcome: ExecutionStatus) -> UsageSummary {
        let ended_at = Utc::now();
        self.ended_at = Some(ended_at);
        self.outcome = Some(outcome);
        self.summary()
    }

    pub fn summary(&self) -> UsageSummary {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        UsageSummary {
            execution_id: self.execution_id,
            total_cost: self.external_cost(),
            input_tokens: self.operations.iter().map(|op| op.input_tokens).sum(),
            output_tokens: self.operations.iter().map(|op| op.output_tokens).sum(),
            operation_count: self.operations.len() as u64,
            duration_ms: (end - self.started_at).num_milliseconds().max(0) as u64,
        }
    }
}

/// Returned alongside every execution result, whatever the outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub execution_id: ExecutionId,
    pub total_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub operation_count: u64,
    pub duration_ms: u64,
}

/// Deployment cost merged with externally tracked invocation cost for one hiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiringUsage {
    pub hiring_id: HiringId,
    pub snapshot_count: u64,
    pub deployment_cost: f64,
    pub execution_count: u64,
    pub external_cost: f64,
    pub total_cost: f64,
}

impl HiringUsage {
    pub fn compute(
        hiring_id: HiringId,
        snapshots: &[ResourceSnapshot],
        executions: &[ExecutionUsage],
    ) -> Self {
        let own_snapshots = snapshots.iter().filter(|s| s.hiring_id == hiring_id);
        let (snapshot_count, deployment_cost) =
            own_snapshots.fold((0, 0.0), |(n, sum), s| (n + 1, sum + s.total_cost()));
        let (execution_count, external_cost) = executions
            .iter()
            .filter(|u| u.hiring_id == hiring_id)
            .fold((0, 0.0), |(n, sum), u| (n + 1, sum + u.external_cost()));

        Self {
            hiring_id,
            snapshot_count,
            deployment_cost,
            execution_count,
            external_cost,
            total_cost: deployment_cost + external_cost,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub accrued: f64,
    pub estimate: f64,
    pub budget: Option<f64>,
    /// `max(0, budget - accrued)`; `None` when the user has no budget.
    pub remaining: Option<f64>,
}

impl BudgetCheck {
    pub fn evaluate(accrued: f64, estimate: f64, budget: Option<f64>) -> Self {
        match budget {
            Some(limit) => Self {
                allowed: accrued + estimate <= limit,
                accrued,
                estimate,
                budget,
                remaining: Some((limit - accrued).max(0.0)),
            },
            None => Self {
                allowed: true,
                accrued,
                estimate,
                budget: None,
                remaining: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSummary {
    pub user_id: UserId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub accrued: f64,
    pub budget: Option<f64>,
    pub remaining: Option<f64>,
    pub hirings: Vec<HiringUsage>,
}
