//! HTTP gateway execution backend.
//!
//! POSTs execution requests to an external gateway that runs the agent and
//! reports completion through the webhook intake. The returned correlation
//! id backs the cancellable handle.

use crate::config::ProviderConfig;
use crate::provider::{AgentHandle, AgentProvider, ExecutionRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Gateway-backed [`AgentProvider`].
pub struct HttpProvider {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct LaunchResponse {
    id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    running: bool,
}

impl HttpProvider {
    pub fn new(name: &str, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .with_context(|| format!("http provider '{}' has no url", config.name))?;
        Self::new(&config.name, url)
    }
}

#[async_trait]
impl AgentProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_availability(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn launch(&self, request: &ExecutionRequest) -> Result<Box<dyn AgentHandle>> {
        let url = format!("{}/executions", self.base_url);
        let body = json!({
            "workflow_id": request.workflow_id,
            "step_id": request.step_id,
            "agent_type": request.agent_type,
            "issue_number": request.subject,
            "prompt": request.prompt,
            "timeout_seconds": request.timeout_seconds,
            "metadata": request.metadata,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach gateway {}", self.base_url))?;
        anyhow::ensure!(
            response.status().is_success(),
            "gateway rejected launch: {}",
            response.status()
        );
        let launched: LaunchResponse = response
            .json()
            .await
            .context("Gateway launch response was not valid JSON")?;

        tracing::info!(
            "Launched agent {} for workflow {} via gateway {} (execution {})",
            request.agent_type,
            request.workflow_id,
            self.name,
            launched.id
        );

        Ok(Box::new(HttpHandle {
            execution_id: launched.id,
            base_url: self.base_url.clone(),
            client: self.client.clone(),
        }))
    }
}

/// Handle over a gateway-managed execution.
pub struct HttpHandle {
    execution_id: String,
    base_url: String,
    client: reqwest::Client,
}

#[async_trait]
impl AgentHandle for HttpHandle {
    fn id(&self) -> String {
        self.execution_id.clone()
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    async fn is_alive(&self) -> bool {
        let url = format!("{}/executions/{}", self.base_url, self.execution_id);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response
                .json::<StatusResponse>()
                .await
                .map(|status| status.running)
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn terminate(&self) -> Result<()> {
        let url = format!("{}/executions/{}", self.base_url, self.execution_id);
        self.client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("Failed to cancel execution {}", self.execution_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_normalized() {
        let provider = HttpProvider::new("gateway", "http://localhost:8081/").unwrap();
        assert_eq!(provider.base_url, "http://localhost:8081");
    }

    #[tokio::test]
    async fn unreachable_gateway_is_unavailable() {
        // Reserved TEST-NET address; connections fail fast.
        let provider = HttpProvider::new("gateway", "http://192.0.2.1:9").unwrap();
        assert!(!provider.check_availability().await);
    }
}
