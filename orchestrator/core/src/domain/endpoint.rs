// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP contract exposed by networked deployments: `GET /health` and
//! `POST /chat`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: String,
    pub context: Value,
}

/// Outcome of a health probe. Only `Healthy` and `Unhealthy` are explicit
/// answers from the agent; `Unreachable` covers transport noise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    Healthy,
    Unhealthy { status: u16 },
    Unreachable(String),
}

impl HealthProbe {
    /// `Some(healthy)` for explicit answers, `None` when the probe proved nothing.
    pub fn verdict(&self) -> Option<bool> {
        match self {
            HealthProbe::Healthy => Some(true),
            HealthProbe::Unhealthy { .. } => Some(false),
            HealthProbe::Unreachable(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Agent endpoint timed out after {0:?}")]
    Timeout(Duration),
    #[error("Agent endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Agent endpoint unreachable: {0}")]
    Transport(String),
    #[error("Agent endpoint returned invalid JSON: {0}")]
    Decode(String),
}

#[async_trait]
pub trait AgentEndpointClient: Send + Sync {
    async fn health(&self, base_url: &str, timeout: Duration) -> HealthProbe;

    async fn chat(
        &self,
        base_url: &str,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<Value, EndpointError>;
}
