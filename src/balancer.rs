// Load balancer: chooses an upstream API configuration for a model
//
// Configs arrive from the store already priority-sorted. With a single
// candidate there is nothing to balance; with several, the per-model rule
// picks the strategy, defaulting to the priority order.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{GatewayError, Result};
use crate::pool::pick_weighted;
use crate::store::entities::{ApiConfig, Strategy};
use crate::store::GatewayStore;

pub struct LoadBalancer {
    store: Arc<dyn GatewayStore>,
    /// Per-model round-robin cursors
    cursors: Mutex<HashMap<String, usize>>,
}

impl LoadBalancer {
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self {
            store,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub async fn select_config(&self, model: &str, load_balance_enabled: bool) -> Result<ApiConfig> {
        let configs = self.store.active_configs_for_model(model).await?;

        if configs.is_empty() {
            return Err(GatewayError::ModelNotFound(model.to_string()));
        }
        if configs.len() == 1 || !load_balance_enabled {
            return Ok(configs.into_iter().next().unwrap());
        }

        let rule = self.store.load_balancer_rule(model).await?;
        let index = match rule.map(|r| r.strategy) {
            Some(Strategy::RoundRobin) => {
                let mut cursors = self.cursors.lock().unwrap();
                let cursor = cursors.entry(model.to_string()).or_insert(0);
                let index = *cursor % configs.len();
                *cursor = (*cursor + 1) % configs.len();
                index
            }
            Some(Strategy::WeightedRoundRobin) => {
                let weights: Vec<u32> = configs.iter().map(|c| c.weight).collect();
                pick_weighted(&weights)
            }
            Some(Strategy::LeastConnections) => {
                // Config-level connection counts are not tracked; fall back to
                // the priority order like the absent-rule case
                0
            }
            Some(Strategy::Random) => rand::thread_rng().gen_range(0..configs.len()),
            // No rule: first config, already priority-sorted
            None => 0,
        };

        Ok(configs.into_iter().nth(index).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{ConfigType, LoadBalancerRule, ProviderKind};
    use crate::store::memory::MemoryStore;

    fn config(id: i64, priority: i32, weight: u32) -> ApiConfig {
        ApiConfig {
            id,
            name: format!("cfg-{}", id),
            provider: ProviderKind::OpenAI,
            config_type: ConfigType::Direct,
            account_pool_id: None,
            base_url: "https://api.openai.com".into(),
            api_key: Some("sk".into()),
            models: vec!["gpt-4".into()],
            headers: Default::default(),
            metadata: serde_json::json!({}),
            is_active: true,
            priority,
            weight,
            max_rps: None,
            timeout_seconds: None,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let store = Arc::new(MemoryStore::new());
        let balancer = LoadBalancer::new(store as Arc<dyn GatewayStore>);
        assert!(matches!(
            balancer.select_config("nope", true).await,
            Err(GatewayError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_single_config_short_circuits() {
        let store = Arc::new(MemoryStore::new());
        store.put_config(config(1, 0, 1));
        let balancer = LoadBalancer::new(store as Arc<dyn GatewayStore>);
        let chosen = balancer.select_config("gpt-4", true).await.unwrap();
        assert_eq!(chosen.id, 1);
    }

    #[tokio::test]
    async fn test_no_rule_takes_priority_order() {
        let store = Arc::new(MemoryStore::new());
        store.put_config(config(1, 10, 1));
        store.put_config(config(2, 1, 1));
        let balancer = LoadBalancer::new(store as Arc<dyn GatewayStore>);
        let chosen = balancer.select_config("gpt-4", true).await.unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[tokio::test]
    async fn test_round_robin_rule_cycles() {
        let store = Arc::new(MemoryStore::new());
        store.put_config(config(1, 0, 1));
        store.put_config(config(2, 1, 1));
        store.put_lb_rule(LoadBalancerRule {
            model_name: "gpt-4".into(),
            strategy: Strategy::RoundRobin,
            is_active: true,
        });
        let balancer = LoadBalancer::new(store as Arc<dyn GatewayStore>);

        let a = balancer.select_config("gpt-4", true).await.unwrap().id;
        let b = balancer.select_config("gpt-4", true).await.unwrap().id;
        let c = balancer.select_config("gpt-4", true).await.unwrap().id;
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[tokio::test]
    async fn test_disabled_load_balance_takes_first() {
        let store = Arc::new(MemoryStore::new());
        store.put_config(config(1, 0, 1));
        store.put_config(config(2, 1, 1));
        store.put_lb_rule(LoadBalancerRule {
            model_name: "gpt-4".into(),
            strategy: Strategy::Random,
            is_active: true,
        });
        let balancer = LoadBalancer::new(store as Arc<dyn GatewayStore>);
        for _ in 0..5 {
            assert_eq!(balancer.select_config("gpt-4", false).await.unwrap().id, 1);
        }
    }
}
