// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Error taxonomy surfaced by every application service.

use thiserror::Error;

use crate::domain::deployment::DeploymentError;
use crate::domain::execution::ExecutionError;
use crate::domain::repository::RepositoryError;
use crate::domain::runtime::RuntimeError;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Bad input or an access rule; raised before any side effect.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No free port, or the action would exceed a monthly budget.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Runtime failure: {0}")]
    RuntimeFailure(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Partial failure: {succeeded} succeeded, {failed} failed")]
    PartialFailure { succeeded: usize, failed: usize },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl OrchestrationError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        OrchestrationError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrchestrationError::NotFound { .. }
                | OrchestrationError::Repository(RepositoryError::NotFound(_))
        )
    }
}

impl From<RuntimeError> for OrchestrationError {
    fn from(err: RuntimeError) -> Self {
        OrchestrationError::RuntimeFailure(err.to_string())
    }
}

impl From<DeploymentError> for OrchestrationError {
    fn from(err: DeploymentError) -> Self {
        OrchestrationError::Validation(err.to_string())
    }
}

impl From<ExecutionError> for OrchestrationError {
    fn from(err: ExecutionError) -> Self {
        OrchestrationError::Validation(err.to_string())
    }
}
