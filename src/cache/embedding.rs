// Embedding service client
//
// The embedding service is an external collaborator reached by HTTP POST
// /embed; it returns a float vector for a text. Its timeout is independent
// of the adapter timeouts.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GatewayError, Result};

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

pub struct EmbeddingClient {
    client: Client,
}

impl EmbeddingClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create embedding HTTP client: {}", e))?;
        Ok(Self { client })
    }

    pub async fn embed(&self, base_url: &str, text: &str, timeout_secs: u64) -> Result<Vec<f32>> {
        let url = format!("{}/embed", base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .json(&EmbedRequest { text })
            .send()
            .await
            .map_err(|e| {
                GatewayError::Internal(anyhow::anyhow!("embedding request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::upstream(status.as_u16(), &body));
        }

        let parsed: EmbedResponse = response.json().await.map_err(|e| {
            GatewayError::Internal(anyhow::anyhow!("bad embedding response: {}", e))
        })?;
        Ok(parsed.embedding)
    }
}
