// Account pool manager
//
// Selects one credential from a pool per request. Round-robin cursors live in
// a single mutex-guarded map; the critical section is O(1) and never covers
// network I/O. OAuth refresh for expired Kiro credentials happens before the
// health gate so a freshly-refreshed account can serve immediately.

use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{GatewayError, Result};
use crate::oauth::RefreshService;
use crate::store::entities::{Credential, HealthStatus, ProviderKind, Strategy};
use crate::store::GatewayStore;

/// Error-rate threshold beyond which a credential is marked unhealthy
const ERROR_RATE_LIMIT: f64 = 0.5;

pub struct AccountPoolManager {
    store: Arc<dyn GatewayStore>,
    refresh: RefreshService,
    /// Per-pool round-robin cursors
    cursors: Mutex<HashMap<i64, usize>>,
}

impl AccountPoolManager {
    pub fn new(store: Arc<dyn GatewayStore>) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            refresh: RefreshService::new()?,
            cursors: Mutex::new(HashMap::new()),
        })
    }

    /// Pick a credential for this request and count it
    pub async fn select_credential(&self, pool_id: i64) -> Result<Credential> {
        let pool = self
            .store
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| GatewayError::Validation(format!("account pool {} not found", pool_id)))?;
        if !pool.is_active {
            return Err(GatewayError::Forbidden(format!(
                "account pool {} is inactive",
                pool_id
            )));
        }

        let credentials = self.store.active_credentials(pool_id).await?;
        if credentials.is_empty() {
            return Err(GatewayError::Forbidden(format!(
                "account pool {} has no active credentials",
                pool_id
            )));
        }

        let index = self.pick_index(pool_id, pool.strategy, &credentials);
        let mut credential = credentials[index].clone();

        if credential.provider == ProviderKind::Kiro && credential.is_expired(Utc::now()) {
            credential = self.refresh_credential(credential).await?;
        }

        if !credential.is_healthy() {
            return Err(GatewayError::Forbidden(format!(
                "credential {} is not healthy",
                credential.id
            )));
        }
        if credential.is_rate_limited() {
            return Err(GatewayError::QuotaExceeded(format!(
                "credential {} is rate limited",
                credential.id
            )));
        }

        self.store
            .bump_credential_counters(credential.id, 1, 0)
            .await?;
        credential.total_requests += 1;

        Ok(credential)
    }

    fn pick_index(&self, pool_id: i64, strategy: Strategy, credentials: &[Credential]) -> usize {
        match strategy {
            Strategy::RoundRobin => {
                let mut cursors = self.cursors.lock().unwrap();
                let cursor = cursors.entry(pool_id).or_insert(0);
                let index = *cursor % credentials.len();
                *cursor = (*cursor + 1) % credentials.len();
                index
            }
            Strategy::WeightedRoundRobin => {
                let weights: Vec<u32> = credentials.iter().map(|c| c.weight).collect();
                pick_weighted(&weights)
            }
            Strategy::LeastConnections => credentials
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.total_requests)
                .map(|(i, _)| i)
                .unwrap_or(0),
            Strategy::Random => rand::thread_rng().gen_range(0..credentials.len()),
        }
    }

    async fn refresh_credential(&self, credential: Credential) -> Result<Credential> {
        match self.refresh.refresh(&credential).await {
            Ok(token) => {
                self.store
                    .update_credential_tokens(
                        credential.id,
                        &token.access_token,
                        token.refresh_token.as_deref(),
                        token.expires_at,
                    )
                    .await?;
                let mut refreshed = credential;
                refreshed.access_token = Some(token.access_token);
                if let Some(rt) = token.refresh_token {
                    refreshed.refresh_token = Some(rt);
                }
                refreshed.expires_at = Some(token.expires_at);
                if let Some(arn) = token.profile_arn {
                    if let serde_json::Value::Object(ref mut map) = refreshed.metadata {
                        map.insert("profile_arn".to_string(), serde_json::Value::String(arn));
                    }
                }
                Ok(refreshed)
            }
            Err(e) => {
                tracing::error!(
                    "Token refresh failed for credential {}: {}",
                    credential.id,
                    e
                );
                self.store
                    .update_credential_health(credential.id, HealthStatus::Unhealthy)
                    .await?;
                Err(GatewayError::Forbidden(format!(
                    "credential {} token refresh failed",
                    credential.id
                )))
            }
        }
    }

    /// Report a completed request against the selected credential
    pub async fn report_result(&self, credential_id: i64, success: bool) {
        if !success {
            if let Err(e) = self
                .store
                .bump_credential_counters(credential_id, 0, 1)
                .await
            {
                tracing::warn!("Failed to bump error counter: {}", e);
                return;
            }
        }

        // Re-read counters; flip health when the rolling error rate crosses the limit
        if !success {
            if let Ok(Some(cred)) = self.store.get_credential(credential_id).await {
                if cred.error_rate() > ERROR_RATE_LIMIT {
                    tracing::warn!(
                        "Credential {} error rate {:.2} exceeds limit, marking unhealthy",
                        credential_id,
                        cred.error_rate()
                    );
                    let _ = self
                        .store
                        .update_credential_health(credential_id, HealthStatus::Unhealthy)
                        .await;
                }
            }
        }
    }
}

/// Weighted pick: random integer in [0, Σweight), subtract weights in
/// iteration order, first to cross zero wins. Zero total falls back to the
/// first entry.
pub fn pick_weighted(weights: &[u32]) -> usize {
    let total: u64 = weights.iter().map(|w| *w as u64).sum();
    if total == 0 {
        return 0;
    }
    let mut remaining = rand::thread_rng().gen_range(0..total) as i64;
    for (i, w) in weights.iter().enumerate() {
        remaining -= *w as i64;
        if remaining < 0 {
            return i;
        }
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{AccountPool, AuthType};
    use crate::store::memory::MemoryStore;

    fn credential(id: i64, pool_id: i64, weight: u32) -> Credential {
        Credential {
            id,
            pool_id,
            provider: ProviderKind::OpenAI,
            auth_type: AuthType::ApiKey,
            api_key: Some(format!("sk-{}", id)),
            access_token: None,
            refresh_token: None,
            session_token: None,
            expires_at: None,
            weight,
            is_active: true,
            health: HealthStatus::Healthy,
            total_requests: 0,
            total_errors: 0,
            metadata: serde_json::json!({}),
        }
    }

    fn seed_pool(store: &MemoryStore, strategy: Strategy, weights: &[u32]) {
        store.put_pool(AccountPool {
            id: 1,
            provider: ProviderKind::OpenAI,
            strategy,
            is_active: true,
        });
        for (i, w) in weights.iter().enumerate() {
            store.put_credential(credential(i as i64 + 1, 1, *w));
        }
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_once_per_cycle() {
        let store = Arc::new(MemoryStore::new());
        seed_pool(&store, Strategy::RoundRobin, &[1, 1, 1]);
        let manager = AccountPoolManager::new(store.clone() as Arc<dyn GatewayStore>).unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let cred = manager.select_credential(1).await.unwrap();
            seen.insert(cred.id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn test_least_connections_prefers_idle() {
        let store = Arc::new(MemoryStore::new());
        seed_pool(&store, Strategy::LeastConnections, &[1, 1]);
        // Credential 1 has served more requests
        store
            .bump_credential_counters(1, 10, 0)
            .await
            .unwrap();
        let manager = AccountPoolManager::new(store.clone() as Arc<dyn GatewayStore>).unwrap();

        let cred = manager.select_credential(1).await.unwrap();
        assert_eq!(cred.id, 2);
    }

    #[tokio::test]
    async fn test_inactive_pool_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.put_pool(AccountPool {
            id: 1,
            provider: ProviderKind::OpenAI,
            strategy: Strategy::Random,
            is_active: false,
        });
        let manager = AccountPoolManager::new(store.clone() as Arc<dyn GatewayStore>).unwrap();
        assert!(matches!(
            manager.select_credential(1).await,
            Err(GatewayError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_unhealthy_credential_rejected() {
        let store = Arc::new(MemoryStore::new());
        seed_pool(&store, Strategy::RoundRobin, &[1]);
        store
            .update_credential_health(1, HealthStatus::Unhealthy)
            .await
            .unwrap();
        let manager = AccountPoolManager::new(store.clone() as Arc<dyn GatewayStore>).unwrap();
        assert!(matches!(
            manager.select_credential(1).await,
            Err(GatewayError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_error_reports_flip_health() {
        let store = Arc::new(MemoryStore::new());
        seed_pool(&store, Strategy::RoundRobin, &[1]);
        let manager = AccountPoolManager::new(store.clone() as Arc<dyn GatewayStore>).unwrap();

        // Two requests, two errors: rate 1.0 > 0.5
        manager.select_credential(1).await.unwrap();
        manager.report_result(1, false).await;
        let selected = manager.select_credential(1).await;
        // Depending on when the flip landed the second select may already fail
        if selected.is_ok() {
            manager.report_result(1, false).await;
        }

        let cred = store.get_credential(1).unwrap();
        assert_eq!(cred.health, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_weighted_distribution_tracks_ratios() {
        let weights = [1u32, 2, 7];
        let mut counts = [0usize; 3];
        let rounds = 10_000;
        for _ in 0..rounds {
            counts[pick_weighted(&weights)] += 1;
        }
        let total: u32 = weights.iter().sum();
        for (i, w) in weights.iter().enumerate() {
            let expected = rounds as f64 * (*w as f64 / total as f64);
            let deviation = (counts[i] as f64 - expected).abs() / rounds as f64;
            assert!(
                deviation < 0.05,
                "weight {} deviates too far: {} vs {}",
                i,
                counts[i],
                expected
            );
        }
    }

    #[test]
    fn test_weighted_zero_total_falls_back_to_first() {
        assert_eq!(pick_weighted(&[0, 0, 0]), 0);
    }
}
