// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Entities, state machines and ports of the orchestration engine.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and traits; no I/O

pub mod agent;
pub mod billing;
pub mod deployment;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod execution;
pub mod hiring;
pub mod identity;
pub mod node_config;
pub mod repository;
pub mod runtime;
pub mod validation;
