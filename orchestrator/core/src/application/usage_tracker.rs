// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-execution usage bracket: opened before dispatch, closed with the
//! outcome, collecting metered operations in between.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::billing::{ExecutionUsage, UsageOperation, UsageSummary};
use crate::domain::error::OrchestrationError;
use crate::domain::execution::{ExecutionId, ExecutionStatus};
use crate::domain::hiring::{HiringId, UserId};
use crate::domain::repository::UsageRepository;

pub struct UsageTracker {
    usage: Arc<dyn UsageRepository>,
    open: DashMap<ExecutionId, ExecutionUsage>,
}

impl UsageTracker {
    pub fn new(usage: Arc<dyn UsageRepository>) -> Self {
        Self {
            usage,
            open: DashMap::new(),
        }
    }

    pub async fn start_usage_tracking(
        &self,
        execution_id: ExecutionId,
        hiring_id: HiringId,
        user_id: UserId,
    ) -> Result<(), OrchestrationError> {
        let record = ExecutionUsage::start(execution_id, hiring_id, user_id);
        self.usage.save_execution_usage(&record).await?;
        self.open.insert(execution_id, record);
        debug!(execution_id = %execution_id, "Usage tracking started");
        Ok(())
    }

    async fn load_open(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionUsage, OrchestrationError> {
        if let Some(record) = self.open.get(&execution_id) {
            return Ok(record.clone());
        }
        self.usage
            .find_execution_usage(execution_id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("Execution usage", execution_id))
    }

    pub async fn record_operation(
        &self,
        execution_id: ExecutionId,
        operation: UsageOperation,
    ) -> Result<UsageSummary, OrchestrationError> {
        let mut record = self.load_open(execution_id).await?;
        if !record.is_open() {
            return Err(OrchestrationError::Validation(format!(
                "Usage tracking for execution {} already ended",
                execution_id
            )));
        }
        record.operations.push(operation);
        self.usage.save_execution_usage(&record).await?;
        let summary = record.summary();
        self.open.insert(execution_id, record);
        Ok(summary)
    }

    /// Closes the bracket. Ending twice returns the stored summary unchanged.
    pub async fn end_usage_tracking(
        &self,
        execution_id: ExecutionId,
        outcome: ExecutionStatus,
    ) -> Result<UsageSummary, OrchestrationError> {
        let mut record = self.load_open(execution_id).await?;
        if !record.is_open() {
            warn!(execution_id = %execution_id, "Usage tracking already ended");
            return Ok(record.summary());
        }
        let summary = record.finish(outcome);
        self.usage.save_execution_usage(&record).await?;
        self.open.remove(&execution_id);
        debug!(
            execution_id = %execution_id,
            outcome = %outcome,
            cost = summary.total_cost,
            operations = summary.operation_count,
            "Usage tracking ended"
        );
        Ok(summary)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
