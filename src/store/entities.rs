// Store row types
//
// The relational store is an external collaborator; these structs mirror its
// rows. JSON-ish columns (models, headers, metadata, embeddings) are carried
// as serde_json values and serialized to TEXT by the SQLite backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ==================================================================================================
// Providers & strategies
// ==================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Gemini,
    Kiro,
    Custom,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderKind::OpenAI),
            "anthropic" => Some(ProviderKind::Anthropic),
            "gemini" => Some(ProviderKind::Gemini),
            "kiro" => Some(ProviderKind::Kiro),
            "custom" => Some(ProviderKind::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Kiro => "kiro",
            ProviderKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round_robin" => Some(Strategy::RoundRobin),
            "weighted_round_robin" => Some(Strategy::WeightedRoundRobin),
            "least_connections" => Some(Strategy::LeastConnections),
            "random" => Some(Strategy::Random),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    Direct,
    AccountPool,
}

// ==================================================================================================
// API configuration
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub id: i64,
    pub name: String,
    pub provider: ProviderKind,
    pub config_type: ConfigType,
    pub account_pool_id: Option<i64>,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Models this config can serve
    pub models: Vec<String>,
    pub headers: HashMap<String, String>,
    /// Free-form JSON; Kiro configs carry `model_mappings` here
    pub metadata: serde_json::Value,
    pub is_active: bool,
    /// Lower = preferred
    pub priority: i32,
    pub weight: u32,
    pub max_rps: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ApiConfig {
    pub fn serves_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

// ==================================================================================================
// Account pools & credentials
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPool {
    pub id: i64,
    pub provider: ProviderKind,
    pub strategy: Strategy,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    OAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub pool_id: i64,
    pub provider: ProviderKind,
    pub auth_type: AuthType,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub session_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub weight: u32,
    pub is_active: bool,
    pub health: HealthStatus,
    pub total_requests: u64,
    pub total_errors: u64,
    /// e.g. machine_id, region, profile_arn, oauth flow selector
    pub metadata: serde_json::Value,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => now >= exp,
            None => false,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.health, HealthStatus::Healthy | HealthStatus::Unknown)
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_requests as f64
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.metadata
            .get("rate_limited_until")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .is_some_and(|until| Utc::now() < until)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

// ==================================================================================================
// Load balancing, pricing, quota
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerRule {
    pub model_name: String,
    pub strategy: Strategy,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    pub api_config_id: i64,
    pub model_name: String,
    pub input_price: f64,
    pub output_price: f64,
    pub currency: String,
    /// Tokens per price tick
    pub unit: u32,
    pub is_active: bool,
}

impl Pricing {
    /// ceil of prompt/completion cost in currency units
    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let unit = self.unit.max(1) as f64;
        let raw = (prompt_tokens as f64 / unit) * self.input_price
            + (completion_tokens as f64 / unit) * self.output_price;
        (raw * 1e6).ceil() / 1e6
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quota {
    pub user_id: i64,
    pub total_quota: f64,
    pub used_quota: f64,
    pub daily_cap: Option<f64>,
    pub monthly_cap: Option<f64>,
}

impl Quota {
    pub fn remaining(&self) -> f64 {
        self.total_quota - self.used_quota
    }
}

// ==================================================================================================
// Cache & logging
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub id: i64,
    pub user_id: i64,
    pub cache_key: String,
    pub query_text: String,
    pub embedding: Option<Vec<f32>>,
    pub model: String,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    pub tokens_saved: u32,
    pub hit_count: u64,
    pub expires_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub user_id: i64,
    pub api_key_id: i64,
    pub api_config_id: Option<i64>,
    pub model: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub tokens_used: u32,
    pub error_msg: Option<String>,
}

/// Minimal authentication surface: the key row yields (user_id, api_key_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub is_active: bool,
}

// ==================================================================================================
// Runtime settings
// ==================================================================================================

/// Hot-reloaded policy knobs; a full snapshot is swapped at once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub cache_enabled: bool,
    /// Seconds
    pub cache_ttl: u64,
    pub semantic_enabled: bool,
    /// Cosine similarity threshold in [0, 1]
    pub semantic_threshold: f64,
    pub embedding_enabled: bool,
    pub embedding_url: String,
    /// Seconds
    pub embedding_timeout: u64,
    pub max_retries: u32,
    /// Seconds, default per-adapter timeout
    pub timeout: u64,
    pub enable_load_balance: bool,
    pub default_quota: f64,
    pub default_rate_limit_rps: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl: 3600,
            semantic_enabled: false,
            semantic_threshold: 0.85,
            embedding_enabled: false,
            embedding_url: "http://127.0.0.1:8100".to_string(),
            embedding_timeout: 10,
            max_retries: 3,
            timeout: 30,
            enable_load_balance: true,
            default_quota: 100.0,
            default_rate_limit_rps: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_strategy_parse() {
        assert_eq!(Strategy::parse("round_robin"), Some(Strategy::RoundRobin));
        assert_eq!(
            Strategy::parse("weighted_round_robin"),
            Some(Strategy::WeightedRoundRobin)
        );
        assert_eq!(
            Strategy::parse("least_connections"),
            Some(Strategy::LeastConnections)
        );
        assert_eq!(Strategy::parse("random"), Some(Strategy::Random));
        assert_eq!(Strategy::parse("bogus"), None);
    }

    #[test]
    fn test_credential_expiry() {
        let mut cred = Credential {
            id: 1,
            pool_id: 1,
            provider: ProviderKind::Kiro,
            auth_type: AuthType::OAuth,
            api_key: None,
            access_token: Some("tok".into()),
            refresh_token: Some("ref".into()),
            session_token: None,
            expires_at: Some(Utc::now() + Duration::hours(1)),
            weight: 1,
            is_active: true,
            health: HealthStatus::Healthy,
            total_requests: 0,
            total_errors: 0,
            metadata: serde_json::json!({}),
        };
        assert!(!cred.is_expired(Utc::now()));

        cred.expires_at = Some(Utc::now() - Duration::seconds(5));
        assert!(cred.is_expired(Utc::now()));

        cred.expires_at = None;
        assert!(!cred.is_expired(Utc::now()));
    }

    #[test]
    fn test_credential_error_rate() {
        let cred = Credential {
            id: 1,
            pool_id: 1,
            provider: ProviderKind::OpenAI,
            auth_type: AuthType::ApiKey,
            api_key: Some("sk".into()),
            access_token: None,
            refresh_token: None,
            session_token: None,
            expires_at: None,
            weight: 1,
            is_active: true,
            health: HealthStatus::Healthy,
            total_requests: 10,
            total_errors: 6,
            metadata: serde_json::json!({}),
        };
        assert!(cred.error_rate() > 0.5);
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = Pricing {
            api_config_id: 1,
            model_name: "gpt-4".into(),
            input_price: 3.0,
            output_price: 6.0,
            currency: "USD".into(),
            unit: 1000,
            is_active: true,
        };
        let cost = pricing.cost(2000, 500);
        // 2 * 3.0 + 0.5 * 6.0 = 9.0
        assert!((cost - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_cached_response_expiry() {
        let row = CachedResponse {
            id: 1,
            user_id: 1,
            cache_key: "k".into(),
            query_text: "q".into(),
            embedding: None,
            model: "gpt-4".into(),
            request: serde_json::json!({}),
            response: serde_json::json!({}),
            tokens_saved: 0,
            hit_count: 0,
            expires_at: Utc::now() - Duration::seconds(1),
        };
        assert!(row.is_expired(Utc::now()));
    }
}
