// Model name mapping for the Kiro upstream
//
// Kiro serves Claude models under its own internal IDs. Mappings come from
// the `model_mappings` metadata object of any kiro-type API configuration and
// are cached process-wide for five minutes; a miss triggers a re-read. When
// no configured mapping exists, a prefix table covers the common Claude
// aliases, and the identity mapping is the last resort.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::store::entities::ProviderKind;
use crate::store::GatewayStore;

pub const MAPPING_TTL_SECS: i64 = 300;

/// Prefix fallbacks applied when no configured mapping matches.
/// Longest-prefix-first so specific aliases win.
const PREFIX_FALLBACKS: &[(&str, &str)] = &[
    ("claude-3-5-sonnet", "claude-sonnet-4.5"),
    ("claude-3-5-haiku", "claude-haiku-4.5"),
    ("claude-3-opus", "claude-opus-4.1"),
    ("claude-sonnet-4-5", "claude-sonnet-4.5"),
    ("claude-haiku-4-5", "claude-haiku-4.5"),
];

struct MapperState {
    mappings: HashMap<String, String>,
    loaded_at: Option<DateTime<Utc>>,
}

pub struct ModelMapper {
    state: RwLock<MapperState>,
    store: Arc<dyn GatewayStore>,
}

impl ModelMapper {
    pub fn new(store: Arc<dyn GatewayStore>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(MapperState {
                mappings: HashMap::new(),
                loaded_at: None,
            }),
            store,
        })
    }

    /// Resolve a client-visible model name to Kiro's internal model ID
    pub async fn resolve(&self, model: &str) -> String {
        if let Some(mapped) = self.cached_lookup(model).await {
            return mapped;
        }

        // Miss: refresh from kiro configs and retry once
        self.refresh().await;
        if let Some(mapped) = self.cached_lookup(model).await {
            return mapped;
        }

        for (prefix, target) in PREFIX_FALLBACKS {
            if model.starts_with(prefix) {
                tracing::debug!("Model '{}' mapped by prefix to '{}'", model, target);
                return target.to_string();
            }
        }

        model.to_string()
    }

    async fn cached_lookup(&self, model: &str) -> Option<String> {
        let state = self.state.read().await;
        let fresh = state
            .loaded_at
            .is_some_and(|t| Utc::now() - t < Duration::seconds(MAPPING_TTL_SECS));
        if !fresh {
            return None;
        }
        state.mappings.get(model).cloned()
    }

    /// Re-read mappings from all active kiro configs. Cache fills are
    /// additive within one refresh; the whole map is replaced at once.
    pub async fn refresh(&self) {
        let configs = match self.store.active_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                tracing::warn!("Model mapping refresh failed: {}", e);
                return;
            }
        };

        let mut mappings = HashMap::new();
        for config in configs
            .iter()
            .filter(|c| c.provider == ProviderKind::Kiro)
        {
            if let Some(obj) = config
                .metadata
                .get("model_mappings")
                .and_then(|v| v.as_object())
            {
                for (visible, internal) in obj {
                    if let Some(internal) = internal.as_str() {
                        mappings.insert(visible.clone(), internal.to_string());
                    }
                }
            }
        }

        let mut state = self.state.write().await;
        state.mappings = mappings;
        state.loaded_at = Some(Utc::now());
    }

    /// Drop all cached mappings; the next resolve re-reads
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.mappings.clear();
        state.loaded_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{ApiConfig, ConfigType};
    use crate::store::memory::MemoryStore;

    fn kiro_config(id: i64, mappings: serde_json::Value) -> ApiConfig {
        ApiConfig {
            id,
            name: format!("kiro-{}", id),
            provider: ProviderKind::Kiro,
            config_type: ConfigType::AccountPool,
            account_pool_id: Some(1),
            base_url: String::new(),
            api_key: None,
            models: vec!["claude-sonnet-4.5".into()],
            headers: Default::default(),
            metadata: serde_json::json!({ "model_mappings": mappings }),
            is_active: true,
            priority: 0,
            weight: 1,
            max_rps: None,
            timeout_seconds: None,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_configured_mapping_wins() {
        let store = Arc::new(MemoryStore::new());
        store.put_config(kiro_config(
            1,
            serde_json::json!({"my-alias": "claude-sonnet-4.5"}),
        ));
        let mapper = ModelMapper::new(store as Arc<dyn GatewayStore>);

        assert_eq!(mapper.resolve("my-alias").await, "claude-sonnet-4.5");
    }

    #[tokio::test]
    async fn test_prefix_fallback() {
        let store = Arc::new(MemoryStore::new());
        let mapper = ModelMapper::new(store as Arc<dyn GatewayStore>);

        assert_eq!(
            mapper.resolve("claude-3-5-sonnet-20241022").await,
            "claude-sonnet-4.5"
        );
        assert_eq!(
            mapper.resolve("claude-3-5-haiku-20241022").await,
            "claude-haiku-4.5"
        );
    }

    #[tokio::test]
    async fn test_identity_fallback() {
        let store = Arc::new(MemoryStore::new());
        let mapper = ModelMapper::new(store as Arc<dyn GatewayStore>);

        assert_eq!(mapper.resolve("auto").await, "auto");
    }

    #[tokio::test]
    async fn test_clear_forces_reread() {
        let store = Arc::new(MemoryStore::new());
        store.put_config(kiro_config(1, serde_json::json!({"a": "first"})));
        let mapper = ModelMapper::new(store.clone() as Arc<dyn GatewayStore>);
        assert_eq!(mapper.resolve("a").await, "first");

        store.put_config(kiro_config(1, serde_json::json!({"a": "second"})));
        mapper.clear().await;
        assert_eq!(mapper.resolve("a").await, "second");
    }
}
