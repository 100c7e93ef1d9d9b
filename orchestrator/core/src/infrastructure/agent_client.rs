// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! reqwest-backed [`AgentEndpointClient`].

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::domain::endpoint::{AgentEndpointClient, ChatRequest, EndpointError, HealthProbe};

/// Longest response body echoed back in a status error.
const MAX_ERROR_BODY: usize = 2048;

#[derive(Debug, Clone, Default)]
pub struct HttpAgentClient {
    client: Client,
}

impl HttpAgentClient {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

fn map_transport(error: reqwest::Error, timeout: Duration) -> EndpointError {
    if error.is_timeout() {
        EndpointError::Timeout(timeout)
    } else {
        EndpointError::Transport(error.to_string())
    }
}

#[async_trait]
impl AgentEndpointClient for HttpAgentClient {
    async fn health(&self, base_url: &str, timeout: Duration) -> HealthProbe {
        let url = endpoint(base_url, "health");
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => HealthProbe::Healthy,
            Ok(response) => HealthProbe::Unhealthy {
                status: response.status().as_u16(),
            },
            Err(e) => {
                debug!(url = %url, "Health probe failed: {}", e);
                HealthProbe::Unreachable(e.to_string())
            }
        }
    }

    async fn chat(
        &self,
        base_url: &str,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<Value, EndpointError> {
        let response = self
            .client
            .post(endpoint(base_url, "chat"))
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| map_transport(e, timeout))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| map_transport(e, timeout))?;

        if !status.is_success() {
            let mut body = body;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(EndpointError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| EndpointError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ChatRequest {
        ChatRequest {
            message: "hello".to_string(),
            session_id: "hiring-1".to_string(),
            context: json!({"execution_type": "chat"}),
        }
    }

    #[tokio::test]
    async fn test_health_probe_statuses() {
        let mut server = mockito::Server::new_async().await;
        let ok = server.mock("GET", "/health").with_status(200).create_async().await;

        let client = HttpAgentClient::new();
        let probe = client.health(&server.url(), Duration::from_secs(2)).await;
        assert_eq!(probe, HealthProbe::Healthy);
        ok.assert_async().await;

        server.reset();
        server.mock("GET", "/health").with_status(503).create_async().await;
        let probe = client.health(&server.url(), Duration::from_secs(2)).await;
        assert_eq!(probe, HealthProbe::Unhealthy { status: 503 });
    }

    #[tokio::test]
    async fn test_health_probe_unreachable() {
        let client = HttpAgentClient::new();
        // Port 9 (discard) is closed on test hosts.
        let probe = client.health("http://127.0.0.1:9", Duration::from_millis(500)).await;
        assert_eq!(probe.verdict(), None);
    }

    #[tokio::test]
    async fn test_chat_posts_request_and_decodes_reply() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat")
            .match_body(mockito::Matcher::PartialJson(json!({
                "message": "hello",
                "session_id": "hiring-1"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response":"hi there"}"#)
            .create_async()
            .await;

        let reply = HttpAgentClient::new()
            .chat(&format!("{}/", server.url()), &request(), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(reply["response"], "hi there");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_chat_error_status_and_bad_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = HttpAgentClient::new();
        let err = client
            .chat(&server.url(), &request(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::Status { status: 500, ref body } if body == "boom"));

        server.reset();
        server
            .mock("POST", "/chat")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;
        let err = client
            .chat(&server.url(), &request(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::Decode(_)));
    }
}
