// Error handling module
// Defines error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors that can occur during request processing
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed body, missing model, bad strategy name
    #[error("Validation error: {0}")]
    Validation(String),

    /// API key missing or unknown
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Credential exists but may not be used (inactive, unhealthy, ...)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No API configuration serves the requested model
    #[error("No API configuration for model: {0}")]
    ModelNotFound(String),

    /// Quota exhausted or rate limit hit
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No pricing row for (api_config, model); rejected before the upstream call
    #[error("Pricing not configured for model: {0}")]
    PricingNotConfigured(String),

    /// Non-200 from a provider; message carries a truncated body preview
    #[error("Upstream error: {status} - {message}")]
    Upstream { status: u16, message: String },

    /// Store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Build an upstream error with the body truncated to a preview
    pub fn upstream(status: u16, body: &str) -> Self {
        let preview: String = if body.chars().count() > 500 {
            let truncated: String = body.chars().take(500).collect();
            format!("{}...", truncated)
        } else {
            body.to_string()
        };
        GatewayError::Upstream {
            status,
            message: preview,
        }
    }

    /// HTTP status code reported to the client
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) | GatewayError::PricingNotConfigured(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream { .. }
            | GatewayError::Storage(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Auth(_) => "auth_error",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::QuotaExceeded(_) => "quota_exceeded",
            GatewayError::PricingNotConfigured(_) => "pricing_not_configured",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Storage(_) => "storage_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();

        let message = match &self {
            GatewayError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                "Internal server error".to_string()
            }
            GatewayError::Storage(err) => {
                tracing::error!("Storage error: {}", err);
                "Internal server error".to_string()
            }
            GatewayError::Upstream {
                status: upstream_status,
                message,
            } => format!("Upstream returned {}: {}", upstream_status, message),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
