// SQLite-backed store
//
// JSON-ish columns (models, headers, metadata, embeddings, request/response
// bodies) are TEXT serialized with serde_json. Queries are short and run
// under a single connection mutex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::entities::*;
use super::GatewayStore;
use crate::error::{GatewayError, Result};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                key TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                api_key_id INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS api_configs (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                provider TEXT NOT NULL,
                config_type TEXT NOT NULL,
                account_pool_id INTEGER,
                base_url TEXT NOT NULL,
                api_key TEXT,
                models TEXT NOT NULL,
                headers TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                weight INTEGER NOT NULL DEFAULT 1,
                max_rps INTEGER,
                timeout_seconds INTEGER,
                deleted_at TEXT
            );
            CREATE TABLE IF NOT EXISTS load_balancer_rules (
                model_name TEXT PRIMARY KEY,
                strategy TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS account_pools (
                id INTEGER PRIMARY KEY,
                provider TEXT NOT NULL,
                strategy TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                pool_id INTEGER NOT NULL,
                provider TEXT NOT NULL,
                auth_type TEXT NOT NULL,
                api_key TEXT,
                access_token TEXT,
                refresh_token TEXT,
                session_token TEXT,
                expires_at TEXT,
                weight INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                health TEXT NOT NULL DEFAULT 'unknown',
                total_requests INTEGER NOT NULL DEFAULT 0,
                total_errors INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE TABLE IF NOT EXISTS pricing (
                api_config_id INTEGER NOT NULL,
                model_name TEXT NOT NULL,
                input_price REAL NOT NULL,
                output_price REAL NOT NULL,
                currency TEXT NOT NULL DEFAULT 'USD',
                unit INTEGER NOT NULL DEFAULT 1000,
                is_active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (api_config_id, model_name)
            );
            CREATE TABLE IF NOT EXISTS quotas (
                user_id INTEGER PRIMARY KEY,
                total_quota REAL NOT NULL,
                used_quota REAL NOT NULL DEFAULT 0,
                daily_cap REAL,
                monthly_cap REAL
            );
            CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                api_key_id INTEGER NOT NULL,
                api_config_id INTEGER,
                model TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                response_time_ms INTEGER NOT NULL,
                tokens_used INTEGER NOT NULL,
                error_msg TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS request_caches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                cache_key TEXT NOT NULL,
                query_text TEXT NOT NULL,
                embedding TEXT,
                model TEXT NOT NULL,
                request TEXT NOT NULL,
                response TEXT NOT NULL,
                tokens_saved INTEGER NOT NULL DEFAULT 0,
                hit_count INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_request_caches_key
                ON request_caches (cache_key);
            CREATE TABLE IF NOT EXISTS runtime_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                settings TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn).map_err(|e| GatewayError::Storage(e.to_string()))
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<ApiConfig> {
    let provider: String = row.get("provider")?;
    let config_type: String = row.get("config_type")?;
    let models: String = row.get("models")?;
    let headers: String = row.get("headers")?;
    let metadata: String = row.get("metadata")?;
    let deleted_at: Option<String> = row.get("deleted_at")?;
    Ok(ApiConfig {
        id: row.get("id")?,
        name: row.get("name")?,
        provider: ProviderKind::parse(&provider).unwrap_or(ProviderKind::Custom),
        config_type: if config_type == "account_pool" {
            ConfigType::AccountPool
        } else {
            ConfigType::Direct
        },
        account_pool_id: row.get("account_pool_id")?,
        base_url: row.get("base_url")?,
        api_key: row.get("api_key")?,
        models: parse_json(&models)?,
        headers: parse_json(&headers)?,
        metadata: parse_json(&metadata)?,
        is_active: row.get("is_active")?,
        priority: row.get("priority")?,
        weight: row.get("weight")?,
        max_rps: row.get("max_rps")?,
        timeout_seconds: row.get("timeout_seconds")?,
        deleted_at: deleted_at.as_deref().and_then(parse_datetime),
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let provider: String = row.get("provider")?;
    let auth_type: String = row.get("auth_type")?;
    let health: String = row.get("health")?;
    let expires_at: Option<String> = row.get("expires_at")?;
    let metadata: String = row.get("metadata")?;
    Ok(Credential {
        id: row.get("id")?,
        pool_id: row.get("pool_id")?,
        provider: ProviderKind::parse(&provider).unwrap_or(ProviderKind::Custom),
        auth_type: if auth_type == "oauth" {
            AuthType::OAuth
        } else {
            AuthType::ApiKey
        },
        api_key: row.get("api_key")?,
        access_token: row.get("access_token")?,
        refresh_token: row.get("refresh_token")?,
        session_token: row.get("session_token")?,
        expires_at: expires_at.as_deref().and_then(parse_datetime),
        weight: row.get("weight")?,
        is_active: row.get("is_active")?,
        health: match health.as_str() {
            "healthy" => HealthStatus::Healthy,
            "degraded" => HealthStatus::Degraded,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        },
        total_requests: row.get::<_, i64>("total_requests")? as u64,
        total_errors: row.get::<_, i64>("total_errors")? as u64,
        metadata: parse_json(&metadata)?,
    })
}

fn cache_from_row(row: &Row<'_>) -> rusqlite::Result<CachedResponse> {
    let embedding: Option<String> = row.get("embedding")?;
    let request: String = row.get("request")?;
    let response: String = row.get("response")?;
    let expires_at: String = row.get("expires_at")?;
    Ok(CachedResponse {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        cache_key: row.get("cache_key")?,
        query_text: row.get("query_text")?,
        embedding: match embedding {
            Some(text) => Some(parse_json(&text)?),
            None => None,
        },
        model: row.get("model")?,
        request: parse_json(&request)?,
        response: parse_json(&response)?,
        tokens_saved: row.get("tokens_saved")?,
        hit_count: row.get::<_, i64>("hit_count")? as u64,
        expires_at: parse_datetime(&expires_at).unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl GatewayStore for SqliteStore {
    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT key, user_id, api_key_id, is_active FROM api_keys
                 WHERE key = ?1 AND is_active = 1",
                params![key],
                |row| {
                    Ok(ApiKeyRecord {
                        key: row.get(0)?,
                        user_id: row.get(1)?,
                        api_key_id: row.get(2)?,
                        is_active: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    async fn active_configs_for_model(&self, model: &str) -> Result<Vec<ApiConfig>> {
        let configs = self.active_configs().await?;
        Ok(configs
            .into_iter()
            .filter(|c| c.serves_model(model))
            .collect())
    }

    async fn active_configs(&self) -> Result<Vec<ApiConfig>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM api_configs
                 WHERE is_active = 1 AND deleted_at IS NULL
                 ORDER BY priority ASC, id ASC",
            )?;
            let rows = stmt.query_map([], config_from_row)?;
            rows.collect()
        })
    }

    async fn load_balancer_rule(&self, model: &str) -> Result<Option<LoadBalancerRule>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT model_name, strategy, is_active FROM load_balancer_rules
                 WHERE model_name = ?1 AND is_active = 1",
                params![model],
                |row| {
                    let strategy: String = row.get(1)?;
                    Ok(LoadBalancerRule {
                        model_name: row.get(0)?,
                        strategy: Strategy::parse(&strategy).unwrap_or(Strategy::RoundRobin),
                        is_active: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    async fn get_pool(&self, pool_id: i64) -> Result<Option<AccountPool>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, provider, strategy, is_active FROM account_pools WHERE id = ?1",
                params![pool_id],
                |row| {
                    let provider: String = row.get(1)?;
                    let strategy: String = row.get(2)?;
                    Ok(AccountPool {
                        id: row.get(0)?,
                        provider: ProviderKind::parse(&provider).unwrap_or(ProviderKind::Custom),
                        strategy: Strategy::parse(&strategy).unwrap_or(Strategy::RoundRobin),
                        is_active: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    async fn active_credentials(&self, pool_id: i64) -> Result<Vec<Credential>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM credentials
                 WHERE pool_id = ?1 AND is_active = 1
                 ORDER BY weight DESC, total_requests ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![pool_id], credential_from_row)?;
            rows.collect()
        })
    }

    async fn get_credential(&self, credential_id: i64) -> Result<Option<Credential>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM credentials WHERE id = ?1",
                params![credential_id],
                credential_from_row,
            )
            .optional()
        })
    }

    async fn update_credential_tokens(
        &self,
        credential_id: i64,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE credentials SET
                    access_token = ?2,
                    refresh_token = COALESCE(?3, refresh_token),
                    expires_at = ?4
                 WHERE id = ?1",
                params![
                    credential_id,
                    access_token,
                    refresh_token,
                    expires_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    async fn update_credential_health(
        &self,
        credential_id: i64,
        health: HealthStatus,
    ) -> Result<()> {
        let health_str = match health {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE credentials SET health = ?2 WHERE id = ?1",
                params![credential_id, health_str],
            )?;
            Ok(())
        })
    }

    async fn bump_credential_counters(
        &self,
        credential_id: i64,
        requests: u64,
        errors: u64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE credentials SET
                    total_requests = total_requests + ?2,
                    total_errors = total_errors + ?3
                 WHERE id = ?1",
                params![credential_id, requests as i64, errors as i64],
            )?;
            Ok(())
        })
    }

    async fn get_pricing(&self, api_config_id: i64, model: &str) -> Result<Option<Pricing>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT api_config_id, model_name, input_price, output_price, currency, unit, is_active
                 FROM pricing WHERE api_config_id = ?1 AND model_name = ?2 AND is_active = 1",
                params![api_config_id, model],
                |row| {
                    Ok(Pricing {
                        api_config_id: row.get(0)?,
                        model_name: row.get(1)?,
                        input_price: row.get(2)?,
                        output_price: row.get(3)?,
                        currency: row.get(4)?,
                        unit: row.get(5)?,
                        is_active: row.get(6)?,
                    })
                },
            )
            .optional()
        })
    }

    async fn get_quota(&self, user_id: i64) -> Result<Option<Quota>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, total_quota, used_quota, daily_cap, monthly_cap
                 FROM quotas WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(Quota {
                        user_id: row.get(0)?,
                        total_quota: row.get(1)?,
                        used_quota: row.get(2)?,
                        daily_cap: row.get(3)?,
                        monthly_cap: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    async fn deduct_quota(&self, user_id: i64, cost: f64) -> Result<()> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE quotas SET used_quota = used_quota + ?2 WHERE user_id = ?1",
                params![user_id, cost],
            )
        })?;
        if updated == 0 {
            return Err(GatewayError::Storage(format!(
                "no quota row for user {}",
                user_id
            )));
        }
        Ok(())
    }

    async fn insert_request_log(&self, entry: &RequestLogEntry) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO request_logs
                    (user_id, api_key_id, api_config_id, model, status_code,
                     response_time_ms, tokens_used, error_msg)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.user_id,
                    entry.api_key_id,
                    entry.api_config_id,
                    entry.model,
                    entry.status_code,
                    entry.response_time_ms as i64,
                    entry.tokens_used,
                    entry.error_msg,
                ],
            )?;
            Ok(())
        })
    }

    async fn find_cache_by_key(&self, cache_key: &str) -> Result<Option<CachedResponse>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM request_caches
                 WHERE cache_key = ?1 AND expires_at > ?2
                 ORDER BY id ASC LIMIT 1",
                params![cache_key, Utc::now().to_rfc3339()],
                cache_from_row,
            )
            .optional()
        })
    }

    async fn bump_cache_hit(&self, cache_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE request_caches SET hit_count = hit_count + 1 WHERE id = ?1",
                params![cache_id],
            )?;
            Ok(())
        })
    }

    async fn insert_cache(&self, row: &CachedResponse) -> Result<()> {
        // INSERT OR IGNORE: first wins against the unique fingerprint index
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO request_caches
                    (user_id, cache_key, query_text, embedding, model,
                     request, response, tokens_saved, hit_count, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.user_id,
                    row.cache_key,
                    row.query_text,
                    row.embedding
                        .as_ref()
                        .map(|e| serde_json::to_string(e).unwrap_or_default()),
                    row.model,
                    row.request.to_string(),
                    row.response.to_string(),
                    row.tokens_saved,
                    row.hit_count as i64,
                    row.expires_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    async fn recent_caches_with_embeddings(
        &self,
        user_id: i64,
        model: &str,
        limit: usize,
    ) -> Result<Vec<CachedResponse>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM request_caches
                 WHERE user_id = ?1 AND model = ?2 AND embedding IS NOT NULL
                   AND expires_at > ?3
                 ORDER BY id DESC LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![user_id, model, Utc::now().to_rfc3339(), limit as i64],
                cache_from_row,
            )?;
            rows.collect()
        })
    }

    async fn load_runtime_settings(&self) -> Result<RuntimeSettings> {
        let text: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT settings FROM runtime_settings WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
        })?;
        match text {
            Some(text) => serde_json::from_str(&text)
                .map_err(|e| GatewayError::Storage(format!("bad runtime settings: {}", e))),
            None => Ok(RuntimeSettings::default()),
        }
    }
}
