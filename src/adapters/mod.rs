// Upstream adapters
//
// One adapter per provider protocol. Each exposes a non-streaming call
// returning the unified response and a streaming call returning raw bytes in
// OpenAI SSE chunk form (the gateway's internal stream shape); ingress
// converters reformat per client protocol.

pub mod anthropic;
pub mod gemini;
pub mod kiro;
pub mod openai;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::mapper::ModelMapper;
use crate::models::unified::{UnifiedRequest, UnifiedResponse};
use crate::store::entities::{ApiConfig, Credential, ProviderKind};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const KIRO_TIMEOUT_SECS: u64 = 120;

/// Raw bytes of the upstream stream, already normalized to OpenAI SSE lines
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    async fn call(&self, request: &UnifiedRequest) -> Result<UnifiedResponse>;
    async fn call_stream(&self, request: &UnifiedRequest) -> Result<ByteStream>;
    fn kind(&self) -> ProviderKind;
}

impl std::fmt::Debug for dyn UpstreamAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamAdapter")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Build the reqwest client an adapter uses
pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("failed to build HTTP client: {}", e)))
}

/// Non-200 becomes an upstream error carrying a truncated body preview
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::upstream(status.as_u16(), &body))
}

/// Adapter factory. `custom` configs speak the OpenAI protocol. Kiro needs
/// the model mapper plus token/region/profile-arn, taken from the credential
/// when the config is pool-backed.
pub fn build_adapter(
    config: &ApiConfig,
    credential: Option<&Credential>,
    mapper: Arc<ModelMapper>,
) -> Result<Arc<dyn UpstreamAdapter>> {
    let api_key = credential
        .and_then(|c| c.api_key.clone())
        .or_else(|| config.api_key.clone());

    let timeout = config.timeout_seconds.unwrap_or(match config.provider {
        ProviderKind::Kiro => KIRO_TIMEOUT_SECS,
        _ => DEFAULT_TIMEOUT_SECS,
    });

    match config.provider {
        ProviderKind::OpenAI | ProviderKind::Custom => Ok(Arc::new(openai::OpenAIAdapter::new(
            config.base_url.clone(),
            api_key.unwrap_or_default(),
            config.headers.clone(),
            timeout,
        )?)),
        ProviderKind::Anthropic => Ok(Arc::new(anthropic::AnthropicAdapter::new(
            config.base_url.clone(),
            api_key.unwrap_or_default(),
            config.headers.clone(),
            timeout,
        )?)),
        ProviderKind::Gemini => Ok(Arc::new(gemini::GeminiAdapter::new(
            config.base_url.clone(),
            api_key.unwrap_or_default(),
            timeout,
        )?)),
        ProviderKind::Kiro => {
            let credential = credential.ok_or_else(|| {
                GatewayError::Validation("kiro config requires a pool credential".to_string())
            })?;
            let access_token = credential.access_token.clone().ok_or_else(|| {
                GatewayError::Forbidden(format!("credential {} has no access token", credential.id))
            })?;
            let region = credential
                .meta_str("region")
                .unwrap_or("us-east-1")
                .to_string();
            let profile_arn = credential.meta_str("profile_arn").map(|s| s.to_string());
            let adapter = kiro::KiroAdapter::new(
                mapper,
                access_token,
                region,
                profile_arn,
                credential.meta_str("machine_id").map(|s| s.to_string()),
                timeout,
            )?
            .with_base_url(config.base_url.clone());
            Ok(Arc::new(adapter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::ConfigType;
    use crate::store::memory::MemoryStore;
    use std::collections::HashMap;

    fn config(provider: ProviderKind) -> ApiConfig {
        ApiConfig {
            id: 1,
            name: "test".into(),
            provider,
            config_type: ConfigType::Direct,
            account_pool_id: None,
            base_url: "https://example.com".into(),
            api_key: Some("sk-test".into()),
            models: vec!["m".into()],
            headers: HashMap::new(),
            metadata: serde_json::json!({}),
            is_active: true,
            priority: 0,
            weight: 1,
            max_rps: None,
            timeout_seconds: None,
            deleted_at: None,
        }
    }

    fn mapper() -> Arc<ModelMapper> {
        ModelMapper::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_factory_builds_each_kind() {
        for provider in [
            ProviderKind::OpenAI,
            ProviderKind::Anthropic,
            ProviderKind::Gemini,
            ProviderKind::Custom,
        ] {
            let adapter = build_adapter(&config(provider), None, mapper()).unwrap();
            let expected = match provider {
                ProviderKind::Custom => ProviderKind::OpenAI,
                p => p,
            };
            assert_eq!(adapter.kind(), expected);
        }
    }

    #[test]
    fn test_kiro_requires_credential() {
        let err = build_adapter(&config(ProviderKind::Kiro), None, mapper()).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }
}
