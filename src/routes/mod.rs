// HTTP ingress routes
//
// Three protocol endpoints feed the same orchestrator: OpenAI chat
// completions, Anthropic messages, and Gemini generateContent (model and
// action both ride in the last path segment, split on the colon). Health
// probes stay unauthenticated for load balancers.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::ingress::{converter_for, IngressProtocol};
use crate::middleware;
use crate::models::openai::{ModelList, OpenAIModel};
use crate::orchestrator::{AuthContext, Orchestrator};
use crate::store::GatewayStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn GatewayStore>,
}

pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(models_handler))
        .route("/v1/chat/completions", post(openai_handler))
        .route("/v1/messages", post(anthropic_handler))
        .route("/v1beta/models/:model_action", post(gemini_handler))
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
        .with_state(state)
}

async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Prism Gateway is running",
        "version": VERSION
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /v1/models - every model an active config can serve
async fn models_handler(State(state): State<AppState>) -> Result<Json<ModelList>> {
    let configs = state.store.active_configs().await?;

    let mut seen = BTreeSet::new();
    let mut models = Vec::new();
    for config in &configs {
        for model in &config.models {
            if seen.insert(model.clone()) {
                models.push(OpenAIModel::new(
                    model.clone(),
                    config.provider.as_str().to_string(),
                ));
            }
        }
    }

    Ok(Json(ModelList::new(models)))
}

/// POST /v1/chat/completions - OpenAI protocol
async fn openai_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response> {
    dispatch(state, auth, IngressProtocol::OpenAI, &body, None).await
}

/// POST /v1/messages - Anthropic protocol
async fn anthropic_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response> {
    dispatch(state, auth, IngressProtocol::Anthropic, &body, None).await
}

/// POST /v1beta/models/{model}:{action} - Gemini protocol
async fn gemini_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(model_action): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let (model, action) = model_action.split_once(':').ok_or_else(|| {
        GatewayError::Validation("expected {model}:{action} in path".to_string())
    })?;

    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(GatewayError::Validation(format!(
                "unsupported action: {}",
                other
            )))
        }
    };

    dispatch(
        state,
        auth,
        IngressProtocol::Gemini,
        &body,
        Some((model.to_string(), stream)),
    )
    .await
}

async fn dispatch(
    state: AppState,
    auth: AuthContext,
    protocol: IngressProtocol,
    body: &[u8],
    gemini_route: Option<(String, bool)>,
) -> Result<Response> {
    let converter = converter_for(protocol);

    let model_hint = gemini_route.as_ref().map(|(model, _)| model.as_str());
    let mut request = converter.parse_request(body, model_hint)?;
    if let Some((_, stream)) = &gemini_route {
        request.stream = *stream;
    }

    tracing::info!(
        "Request: protocol={:?} model={} stream={} messages={}",
        protocol,
        request.model,
        request.stream,
        request.messages.len()
    );

    if request.stream {
        let formatter = converter.stream_formatter(&request.model);
        let content_type = formatter.content_type();

        let stream = state
            .orchestrator
            .execute_stream(request, auth, formatter)
            .await?;

        let byte_stream =
            stream.map(|item| item.map_err(|e| std::io::Error::other(e.to_string())));

        Response::builder()
            .status(200)
            .header("Content-Type", content_type)
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .body(Body::from_stream(byte_stream))
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("response build failed: {}", e)))
    } else {
        let completed = state.orchestrator.execute(request, auth).await?;
        let mut value = converter.format_response(&completed.response);
        if completed.cached {
            if let Value::Object(ref mut map) = value {
                map.insert("cached".to_string(), Value::Bool(true));
            }
        }
        Ok(Json(value).into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ModelMapper;
    use crate::runtime_config::RuntimeConfigManager;
    use crate::store::entities::*;
    use crate::store::memory::MemoryStore;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn test_state(store: Arc<MemoryStore>) -> AppState {
        let runtime = RuntimeConfigManager::load(store.clone() as Arc<dyn GatewayStore>)
            .await
            .unwrap();
        let mapper = ModelMapper::new(store.clone() as Arc<dyn GatewayStore>);
        let orchestrator = Arc::new(
            Orchestrator::new(store.clone() as Arc<dyn GatewayStore>, runtime, mapper).unwrap(),
        );
        AppState {
            orchestrator,
            store: store as Arc<dyn GatewayStore>,
        }
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put_api_key(ApiKeyRecord {
            key: "sk-client".into(),
            user_id: 1,
            api_key_id: 7,
            is_active: true,
        });
        store
    }

    #[tokio::test]
    async fn test_health_endpoint_needs_no_auth() {
        let app = health_routes();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_missing_key_is_401() {
        let state = test_state(seeded_store()).await;
        let app = api_routes(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"gpt-4","messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn test_invalid_body_is_400() {
        let state = test_state(seeded_store()).await;
        let app = api_routes(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("authorization", "Bearer sk-client")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_unknown_model_is_404() {
        let store = seeded_store();
        store.put_quota(Quota {
            user_id: 1,
            total_quota: 10.0,
            used_quota: 0.0,
            daily_cap: None,
            monthly_cap: None,
        });
        let state = test_state(store).await;
        let app = api_routes(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("authorization", "Bearer sk-client")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"model":"ghost","messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_gemini_path_split() {
        let store = seeded_store();
        let state = test_state(store).await;
        let app = api_routes(state);
        // Bad action should 400, proving the split works before model lookup
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1beta/models/gemini-pro:badAction?key=sk-client")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"contents":[{"role":"user","parts":[{"text":"hi"}]}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_models_listing() {
        let store = seeded_store();
        store.put_config(ApiConfig {
            id: 1,
            name: "openai".into(),
            provider: ProviderKind::OpenAI,
            config_type: ConfigType::Direct,
            account_pool_id: None,
            base_url: "https://api.openai.com".into(),
            api_key: Some("sk".into()),
            models: vec!["gpt-4".into(), "gpt-4o".into()],
            headers: Default::default(),
            metadata: serde_json::json!({}),
            is_active: true,
            priority: 0,
            weight: 1,
            max_rps: None,
            timeout_seconds: None,
            deleted_at: None,
        });
        let state = test_state(store).await;
        let app = api_routes(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/models")
                    .header("authorization", "Bearer sk-client")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["object"], "list");
        assert_eq!(parsed["data"].as_array().unwrap().len(), 2);
    }
}
