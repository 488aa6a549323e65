// In-memory store
//
// Backs tests and ephemeral deployments. State lives in DashMaps so the
// request path never takes a global lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use super::entities::*;
use super::GatewayStore;
use crate::error::{GatewayError, Result};

#[derive(Default)]
pub struct MemoryStore {
    api_keys: DashMap<String, ApiKeyRecord>,
    configs: DashMap<i64, ApiConfig>,
    lb_rules: DashMap<String, LoadBalancerRule>,
    pools: DashMap<i64, AccountPool>,
    credentials: DashMap<i64, Credential>,
    pricing: DashMap<(i64, String), Pricing>,
    quotas: DashMap<i64, Quota>,
    request_logs: Mutex<Vec<RequestLogEntry>>,
    caches: DashMap<i64, CachedResponse>,
    cache_seq: AtomicI64,
    settings: Mutex<RuntimeSettings>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- seeding helpers (tests and bootstrap) -----------------------------

    pub fn put_api_key(&self, record: ApiKeyRecord) {
        self.api_keys.insert(record.key.clone(), record);
    }

    pub fn put_config(&self, config: ApiConfig) {
        self.configs.insert(config.id, config);
    }

    pub fn put_lb_rule(&self, rule: LoadBalancerRule) {
        self.lb_rules.insert(rule.model_name.clone(), rule);
    }

    pub fn put_pool(&self, pool: AccountPool) {
        self.pools.insert(pool.id, pool);
    }

    pub fn put_credential(&self, credential: Credential) {
        self.credentials.insert(credential.id, credential);
    }

    pub fn put_pricing(&self, pricing: Pricing) {
        self.pricing
            .insert((pricing.api_config_id, pricing.model_name.clone()), pricing);
    }

    pub fn put_quota(&self, quota: Quota) {
        self.quotas.insert(quota.user_id, quota);
    }

    pub fn put_settings(&self, settings: RuntimeSettings) {
        *self.settings.lock().unwrap() = settings;
    }

    pub fn request_logs(&self) -> Vec<RequestLogEntry> {
        self.request_logs.lock().unwrap().clone()
    }

    pub fn get_credential(&self, id: i64) -> Option<Credential> {
        self.credentials.get(&id).map(|c| c.clone())
    }

    pub fn get_quota_row(&self, user_id: i64) -> Option<Quota> {
        self.quotas.get(&user_id).map(|q| q.clone())
    }

    pub fn cache_rows(&self) -> Vec<CachedResponse> {
        self.caches.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>> {
        Ok(self
            .api_keys
            .get(key)
            .filter(|r| r.is_active)
            .map(|r| r.clone()))
    }

    async fn active_configs_for_model(&self, model: &str) -> Result<Vec<ApiConfig>> {
        let mut configs: Vec<ApiConfig> = self
            .configs
            .iter()
            .filter(|c| c.is_active && c.deleted_at.is_none() && c.serves_model(model))
            .map(|c| c.clone())
            .collect();
        configs.sort_by_key(|c| (c.priority, c.id));
        Ok(configs)
    }

    async fn active_configs(&self) -> Result<Vec<ApiConfig>> {
        let mut configs: Vec<ApiConfig> = self
            .configs
            .iter()
            .filter(|c| c.is_active && c.deleted_at.is_none())
            .map(|c| c.clone())
            .collect();
        configs.sort_by_key(|c| (c.priority, c.id));
        Ok(configs)
    }

    async fn load_balancer_rule(&self, model: &str) -> Result<Option<LoadBalancerRule>> {
        Ok(self
            .lb_rules
            .get(model)
            .filter(|r| r.is_active)
            .map(|r| r.clone()))
    }

    async fn get_pool(&self, pool_id: i64) -> Result<Option<AccountPool>> {
        Ok(self.pools.get(&pool_id).map(|p| p.clone()))
    }

    async fn active_credentials(&self, pool_id: i64) -> Result<Vec<Credential>> {
        let mut creds: Vec<Credential> = self
            .credentials
            .iter()
            .filter(|c| c.pool_id == pool_id && c.is_active)
            .map(|c| c.clone())
            .collect();
        creds.sort_by(|a, b| {
            b.weight
                .cmp(&a.weight)
                .then(a.total_requests.cmp(&b.total_requests))
                .then(a.id.cmp(&b.id))
        });
        Ok(creds)
    }

    async fn get_credential(&self, credential_id: i64) -> Result<Option<Credential>> {
        Ok(self.credentials.get(&credential_id).map(|c| c.clone()))
    }

    async fn update_credential_tokens(
        &self,
        credential_id: i64,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut cred = self
            .credentials
            .get_mut(&credential_id)
            .ok_or_else(|| GatewayError::Storage(format!("credential {} not found", credential_id)))?;
        cred.access_token = Some(access_token.to_string());
        if let Some(rt) = refresh_token {
            cred.refresh_token = Some(rt.to_string());
        }
        cred.expires_at = Some(expires_at);
        Ok(())
    }

    async fn update_credential_health(
        &self,
        credential_id: i64,
        health: HealthStatus,
    ) -> Result<()> {
        let mut cred = self
            .credentials
            .get_mut(&credential_id)
            .ok_or_else(|| GatewayError::Storage(format!("credential {} not found", credential_id)))?;
        cred.health = health;
        Ok(())
    }

    async fn bump_credential_counters(
        &self,
        credential_id: i64,
        requests: u64,
        errors: u64,
    ) -> Result<()> {
        let mut cred = self
            .credentials
            .get_mut(&credential_id)
            .ok_or_else(|| GatewayError::Storage(format!("credential {} not found", credential_id)))?;
        cred.total_requests += requests;
        cred.total_errors += errors;
        Ok(())
    }

    async fn get_pricing(&self, api_config_id: i64, model: &str) -> Result<Option<Pricing>> {
        Ok(self
            .pricing
            .get(&(api_config_id, model.to_string()))
            .filter(|p| p.is_active)
            .map(|p| p.clone()))
    }

    async fn get_quota(&self, user_id: i64) -> Result<Option<Quota>> {
        Ok(self.quotas.get(&user_id).map(|q| q.clone()))
    }

    async fn deduct_quota(&self, user_id: i64, cost: f64) -> Result<()> {
        let mut quota = self
            .quotas
            .get_mut(&user_id)
            .ok_or_else(|| GatewayError::Storage(format!("no quota row for user {}", user_id)))?;
        quota.used_quota += cost;
        Ok(())
    }

    async fn insert_request_log(&self, entry: &RequestLogEntry) -> Result<()> {
        self.request_logs.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn find_cache_by_key(&self, cache_key: &str) -> Result<Option<CachedResponse>> {
        let now = Utc::now();
        Ok(self
            .caches
            .iter()
            .filter(|c| c.cache_key == cache_key && !c.is_expired(now))
            .map(|c| c.clone())
            .min_by_key(|c| c.id))
    }

    async fn bump_cache_hit(&self, cache_id: i64) -> Result<()> {
        if let Some(mut row) = self.caches.get_mut(&cache_id) {
            row.hit_count += 1;
        }
        Ok(())
    }

    async fn insert_cache(&self, row: &CachedResponse) -> Result<()> {
        let now = Utc::now();
        // First wins: a live row with the same fingerprint keeps its place
        let exists = self
            .caches
            .iter()
            .any(|c| c.cache_key == row.cache_key && !c.is_expired(now));
        if exists {
            return Ok(());
        }
        let id = self.cache_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut stored = row.clone();
        stored.id = id;
        self.caches.insert(id, stored);
        Ok(())
    }

    async fn recent_caches_with_embeddings(
        &self,
        user_id: i64,
        model: &str,
        limit: usize,
    ) -> Result<Vec<CachedResponse>> {
        let now = Utc::now();
        let mut rows: Vec<CachedResponse> = self
            .caches
            .iter()
            .filter(|c| {
                c.user_id == user_id
                    && c.model == model
                    && c.embedding.is_some()
                    && !c.is_expired(now)
            })
            .map(|c| c.clone())
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn load_runtime_settings(&self) -> Result<RuntimeSettings> {
        Ok(self.settings.lock().unwrap().clone())
    }
}
