// Response cache engine: exact fingerprint matching plus optional semantic
// matching over stored embeddings.
//
// The fingerprint is an MD5 over a canonical serialization of the request
// fields that determine the answer. Canonical means a fixed struct field
// order, so it is stable under caller JSON key reordering and whitespace.

pub mod embedding;

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::models::unified::{Message, UnifiedRequest, UnifiedResponse};
use crate::store::entities::{CachedResponse, RuntimeSettings};
use crate::store::GatewayStore;
use embedding::EmbeddingClient;

/// Scan cap for semantic lookup; bounds worst-case latency per (user, model)
const SEMANTIC_SCAN_LIMIT: usize = 100;

/// Fields that determine the cached answer, in fixed order
#[derive(Serialize)]
struct FingerprintInput<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<u32>,
}

/// MD5 fingerprint over the canonical request form
pub fn cache_key(request: &UnifiedRequest) -> String {
    let input = FingerprintInput {
        model: &request.model,
        messages: &request.messages,
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_tokens,
    };
    let canonical = serde_json::to_string(&input).unwrap_or_default();
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

/// Cosine similarity; None when either vector is empty or lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += (*x as f64).powi(2);
        norm_b += (*y as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

pub struct CacheLookup {
    pub response: UnifiedResponse,
    pub tokens_saved: u32,
}

pub struct CacheEngine {
    store: Arc<dyn GatewayStore>,
    embeddings: EmbeddingClient,
}

impl CacheEngine {
    pub fn new(store: Arc<dyn GatewayStore>) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            embeddings: EmbeddingClient::new()?,
        })
    }

    /// Probe the cache for a non-streaming request. Exact match first, then
    /// semantic if enabled. A hit bumps the row's hit counter.
    pub async fn lookup(
        &self,
        user_id: i64,
        request: &UnifiedRequest,
        settings: &RuntimeSettings,
    ) -> Result<Option<CacheLookup>> {
        if !settings.cache_enabled {
            return Ok(None);
        }

        let key = cache_key(request);
        if let Some(row) = self.store.find_cache_by_key(&key).await? {
            self.store.bump_cache_hit(row.id).await?;
            tracing::debug!("Exact cache hit for key {}", key);
            return Ok(self.decode_row(row));
        }

        if !settings.semantic_enabled || !settings.embedding_enabled {
            return Ok(None);
        }

        let Some(query_text) = request.last_user_text() else {
            return Ok(None);
        };
        let query_embedding = match self
            .embeddings
            .embed(
                &settings.embedding_url,
                query_text,
                settings.embedding_timeout,
            )
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Embedding lookup failed, skipping semantic cache: {}", e);
                return Ok(None);
            }
        };

        let rows = self
            .store
            .recent_caches_with_embeddings(user_id, &request.model, SEMANTIC_SCAN_LIMIT)
            .await?;

        let mut best: Option<(f64, CachedResponse)> = None;
        for row in rows {
            let Some(embedding) = row.embedding.as_deref() else {
                continue;
            };
            // Length mismatches (provider change) skip the row
            let Some(score) = cosine_similarity(&query_embedding, embedding) else {
                continue;
            };
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, row));
            }
        }

        if let Some((score, row)) = best {
            if score >= settings.semantic_threshold {
                tracing::debug!(
                    "Semantic cache hit (similarity {:.3} >= {:.3})",
                    score,
                    settings.semantic_threshold
                );
                self.store.bump_cache_hit(row.id).await?;
                return Ok(self.decode_row(row));
            }
        }

        Ok(None)
    }

    fn decode_row(&self, row: CachedResponse) -> Option<CacheLookup> {
        match serde_json::from_value::<UnifiedResponse>(row.response.clone()) {
            Ok(response) => Some(CacheLookup {
                response,
                tokens_saved: row.tokens_saved,
            }),
            Err(e) => {
                tracing::warn!("Stored cache row {} failed to decode: {}", row.id, e);
                None
            }
        }
    }

    /// Store a successful non-streaming response. Runs on a detached task;
    /// failures are logged and swallowed so they never affect the client.
    pub fn store_async(
        self: Arc<Self>,
        user_id: i64,
        request: UnifiedRequest,
        response: UnifiedResponse,
        settings: Arc<RuntimeSettings>,
    ) {
        tokio::spawn(async move {
            if let Err(e) = self.store(user_id, &request, &response, &settings).await {
                tracing::warn!("Cache store failed: {}", e);
            }
        });
    }

    async fn store(
        &self,
        user_id: i64,
        request: &UnifiedRequest,
        response: &UnifiedResponse,
        settings: &RuntimeSettings,
    ) -> Result<()> {
        if !settings.cache_enabled {
            return Ok(());
        }

        let query_text = request.last_user_text().unwrap_or_default().to_string();

        let embedding = if settings.semantic_enabled
            && settings.embedding_enabled
            && !query_text.is_empty()
        {
            match self
                .embeddings
                .embed(
                    &settings.embedding_url,
                    &query_text,
                    settings.embedding_timeout,
                )
                .await
            {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Embedding for cache store failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let tokens_saved = response
            .usage
            .map(|u| u.total_tokens)
            .unwrap_or_default();

        let row = CachedResponse {
            id: 0,
            user_id,
            cache_key: cache_key(request),
            query_text,
            embedding,
            model: request.model.clone(),
            request: serde_json::to_value(request)
                .map_err(|e| crate::error::GatewayError::Internal(e.into()))?,
            response: serde_json::to_value(response)
                .map_err(|e| crate::error::GatewayError::Internal(e.into()))?,
            tokens_saved,
            hit_count: 0,
            expires_at: Utc::now() + Duration::seconds(settings.cache_ttl as i64),
        };

        self.store.insert_cache(&row).await
    }
}
