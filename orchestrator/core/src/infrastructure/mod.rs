// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent_client;
pub mod build_context;
pub mod db;
pub mod event_bus;
pub mod repositories;
pub mod runtime;

pub use agent_client::HttpAgentClient;
pub use runtime::DockerContainerRuntime;
