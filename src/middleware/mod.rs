// Authentication and CORS middleware
//
// Clients authenticate with an API key in any of the three protocol styles:
// `Authorization: Bearer` (OpenAI/Kiro), `x-api-key` (Anthropic), or a
// `?key=` query parameter (Gemini). The key resolves through the store to
// the (user_id, api_key_id) tuple the rest of the pipeline consumes.

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use tower_http::cors::{Any, CorsLayer};

use crate::error::GatewayError;
use crate::orchestrator::AuthContext;
use crate::routes::AppState;

fn extract_api_key(request: &Request<Body>) -> Option<String> {
    if let Some(auth_header) = request.headers().get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(key) = auth_str.strip_prefix("Bearer ") {
                return Some(key.trim().to_string());
            }
        }
    }

    if let Some(api_key_header) = request.headers().get("x-api-key") {
        if let Ok(key) = api_key_header.to_str() {
            return Some(key.trim().to_string());
        }
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("key=")
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        })
    })
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    let Some(key) = extract_api_key(&request) else {
        tracing::warn!(
            "Missing API key: {} {}",
            request.method(),
            request.uri().path()
        );
        return Err(GatewayError::Auth("Missing API key".to_string()));
    };

    let record = state
        .store
        .find_api_key(&key)
        .await?
        .ok_or_else(|| GatewayError::Auth("Invalid API key".to_string()))?;

    request.extensions_mut().insert(AuthContext {
        user_id: record.user_id,
        api_key_id: record.api_key_id,
    });

    Ok(next.run(request).await)
}

/// Permissive CORS; preflight OPTIONS handled automatically
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(header: Option<(&str, &str)>, uri: &str) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_extraction() {
        let req = request_with(Some(("authorization", "Bearer sk-abc")), "/v1/chat/completions");
        assert_eq!(extract_api_key(&req).as_deref(), Some("sk-abc"));
    }

    #[test]
    fn test_x_api_key_extraction() {
        let req = request_with(Some(("x-api-key", "sk-xyz")), "/v1/messages");
        assert_eq!(extract_api_key(&req).as_deref(), Some("sk-xyz"));
    }

    #[test]
    fn test_query_key_extraction() {
        let req = request_with(None, "/v1beta/models/gemini-pro:generateContent?key=sk-q&alt=sse");
        assert_eq!(extract_api_key(&req).as_deref(), Some("sk-q"));
    }

    #[test]
    fn test_missing_key() {
        let req = request_with(None, "/v1/chat/completions");
        assert_eq!(extract_api_key(&req), None);
    }

    #[test]
    fn test_non_bearer_authorization_is_ignored() {
        let req = request_with(Some(("authorization", "Basic dXNlcg==")), "/v1/chat/completions");
        assert_eq!(extract_api_key(&req), None);
    }
}
