// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod billing;
pub mod deployment_manager;
pub mod deployment_workers;
pub mod execution;
pub mod hiring;
pub mod orchestrator;
pub mod port_allocator;
pub mod repository_factory;
pub mod resource_collector;
pub mod usage_tracker;

pub use billing::BillingService;
pub use deployment_manager::{DeploymentManager, DeploymentSettings, Teardown};
pub use execution::{ExecutionResult, ExecutionService, ExecutionSettings, MissingDeploymentPolicy};
pub use hiring::{CleanupOutcome, CleanupReport, CreatedHiring, HiringCoordinator, HiringUpdate};
pub use orchestrator::Orchestrator;
pub use repository_factory::Repositories;
pub use resource_collector::{CollectionReport, ResourceUsageCollector};
pub use usage_tracker::UsageTracker;
