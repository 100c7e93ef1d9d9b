// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! Workload orchestration and metering engine: turns hirings into isolated
//! container deployments, dispatches executions into them and meters cost.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Crate root re-exporting the domain

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
