// Persistence surface
//
// The relational store is an external collaborator; the core consults it
// through this trait. Two backends ship: an in-memory store for tests and
// ephemeral deployments, and a SQLite store.

pub mod entities;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use entities::{
    AccountPool, ApiConfig, ApiKeyRecord, CachedResponse, Credential, HealthStatus,
    LoadBalancerRule, Pricing, Quota, RequestLogEntry, RuntimeSettings,
};

#[async_trait]
pub trait GatewayStore: Send + Sync {
    // -- authentication surface --------------------------------------------

    /// Resolve an ingress API key to its (user_id, api_key_id) tuple
    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>>;

    // -- API configurations -------------------------------------------------

    /// Active, non-deleted configs whose `models` set contains `model`,
    /// ordered by priority ascending
    async fn active_configs_for_model(&self, model: &str) -> Result<Vec<ApiConfig>>;

    /// All active configs (used for model listing and mapper refresh)
    async fn active_configs(&self) -> Result<Vec<ApiConfig>>;

    async fn load_balancer_rule(&self, model: &str) -> Result<Option<LoadBalancerRule>>;

    // -- account pools ------------------------------------------------------

    async fn get_pool(&self, pool_id: i64) -> Result<Option<AccountPool>>;

    /// Active credentials for the pool, ordered by (weight desc, total_requests asc)
    async fn active_credentials(&self, pool_id: i64) -> Result<Vec<Credential>>;

    async fn get_credential(&self, credential_id: i64) -> Result<Option<Credential>>;

    async fn update_credential_tokens(
        &self,
        credential_id: i64,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn update_credential_health(
        &self,
        credential_id: i64,
        health: HealthStatus,
    ) -> Result<()>;

    /// Atomically bump request/error counters
    async fn bump_credential_counters(
        &self,
        credential_id: i64,
        requests: u64,
        errors: u64,
    ) -> Result<()>;

    // -- pricing & quota ----------------------------------------------------

    async fn get_pricing(&self, api_config_id: i64, model: &str) -> Result<Option<Pricing>>;

    async fn get_quota(&self, user_id: i64) -> Result<Option<Quota>>;

    /// Monotone deduction in cost units; fails if the user has no quota row
    async fn deduct_quota(&self, user_id: i64, cost: f64) -> Result<()>;

    // -- request log --------------------------------------------------------

    async fn insert_request_log(&self, entry: &RequestLogEntry) -> Result<()>;

    // -- response cache -----------------------------------------------------

    /// First non-expired row for the fingerprint
    async fn find_cache_by_key(&self, cache_key: &str) -> Result<Option<CachedResponse>>;

    async fn bump_cache_hit(&self, cache_id: i64) -> Result<()>;

    /// Insert; a concurrent duplicate on cache_key is ignored (first wins)
    async fn insert_cache(&self, row: &CachedResponse) -> Result<()>;

    /// Non-expired rows with embeddings for (user, model), newest first,
    /// capped at `limit`
    async fn recent_caches_with_embeddings(
        &self,
        user_id: i64,
        model: &str,
        limit: usize,
    ) -> Result<Vec<CachedResponse>>;

    // -- runtime settings ---------------------------------------------------

    async fn load_runtime_settings(&self) -> Result<RuntimeSettings>;
}
