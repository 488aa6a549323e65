// OpenAI upstream adapter
//
// The unified shape is already OpenAI's, so the request passes through
// nearly verbatim; the stream is forwarded as-is.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;

use super::{check_status, http_client, ByteStream, UpstreamAdapter};
use crate::error::{GatewayError, Result};
use crate::models::unified::{UnifiedRequest, UnifiedResponse};
use crate::store::entities::ProviderKind;

pub struct OpenAIAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    extra_headers: HashMap<String, String>,
}

impl OpenAIAdapter {
    pub fn new(
        base_url: String,
        api_key: String,
        extra_headers: HashMap<String, String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url,
            api_key,
            extra_headers,
        })
    }

    /// `{base}/v1/chat/completions` with a trailing `/v1` in base deduplicated
    fn completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        format!("{}/v1/chat/completions", base)
    }

    fn request_builder(&self, stream: bool, request: &UnifiedRequest) -> reqwest::RequestBuilder {
        let mut body = serde_json::to_value(request).unwrap_or_default();
        if let Some(map) = body.as_object_mut() {
            // Not an OpenAI parameter; other adapters consume it
            map.remove("top_k");
        }
        body["stream"] = serde_json::Value::Bool(stream);
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        let mut builder = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body);
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

#[async_trait]
impl UpstreamAdapter for OpenAIAdapter {
    async fn call(&self, request: &UnifiedRequest) -> Result<UnifiedResponse> {
        let response = self
            .request_builder(false, request)
            .send()
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("openai request failed: {}", e)))?;
        let response = check_status(response).await?;

        response
            .json::<UnifiedResponse>()
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bad openai response: {}", e)))
    }

    async fn call_stream(&self, request: &UnifiedRequest) -> Result<ByteStream> {
        let response = self
            .request_builder(true, request)
            .send()
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("openai request failed: {}", e)))?;
        let response = check_status(response).await?;

        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| GatewayError::Internal(anyhow::anyhow!("openai stream error: {}", e)))
        });
        Ok(Box::pin(stream))
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::unified::{Message, ROLE_USER};

    fn adapter(base: &str) -> OpenAIAdapter {
        OpenAIAdapter::new(base.to_string(), "sk-test".into(), HashMap::new(), 30).unwrap()
    }

    #[test]
    fn test_v1_deduplication() {
        assert_eq!(
            adapter("https://api.openai.com").completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            adapter("https://api.openai.com/v1").completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            adapter("https://api.openai.com/v1/").completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "created": 1700000000,
                    "model": "gpt-4",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "Hello back"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
                }"#,
            )
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        let request = UnifiedRequest::new("gpt-4", vec![Message::text(ROLE_USER, "Hello")]);
        let response = adapter.call(&request).await.unwrap();

        assert_eq!(response.choices[0].message.content, "Hello back");
        assert_eq!(response.usage.unwrap().total_tokens, 8);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upstream_error_carries_status_and_preview() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        let request = UnifiedRequest::new("gpt-4", vec![Message::text(ROLE_USER, "Hello")]);
        let err = adapter.call(&request).await.unwrap_err();
        match err {
            GatewayError::Upstream { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
