// OAuth token refresh for Kiro credentials
//
// Two flows exist in the wild: Kiro Desktop auth (Social login, JSON body)
// and AWS SSO OIDC (form-urlencoded). The credential's metadata selects the
// flow; both return a fresh access token with an expiry we buffer by 60s.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::store::entities::Credential;

const EXPIRY_BUFFER_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub profile_arn: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KiroRefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KiroRefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    profile_arn: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SsoOidcResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

fn kiro_refresh_url(region: &str) -> String {
    format!("https://prod.{}.auth.desktop.kiro.dev/refreshToken", region)
}

fn sso_oidc_url(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com/token", region)
}

/// Stable per-host fingerprint for the refresh User-Agent
pub fn machine_fingerprint() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

pub struct RefreshService {
    client: Client,
}

impl RefreshService {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create refresh HTTP client")?;
        Ok(Self { client })
    }

    /// Refresh the credential's access token; the flow comes from
    /// `metadata.oauth_flow` ("desktop" or "sso_oidc", desktop by default)
    pub async fn refresh(&self, credential: &Credential) -> Result<TokenData> {
        let flow = credential.meta_str("oauth_flow").unwrap_or("desktop");
        match flow {
            "sso_oidc" => self.refresh_sso_oidc(credential).await,
            _ => self.refresh_desktop(credential).await,
        }
    }

    async fn refresh_desktop(&self, credential: &Credential) -> Result<TokenData> {
        let refresh_token = credential
            .refresh_token
            .as_ref()
            .context("OAuth credential has no refresh token")?;
        let region = credential.meta_str("region").unwrap_or("us-east-1");

        tracing::info!(
            "Refreshing Kiro credential {} via Desktop auth",
            credential.id
        );

        let response = self
            .client
            .post(kiro_refresh_url(region))
            .header("Content-Type", "application/json")
            .header(
                "User-Agent",
                format!("KiroIDE-0.7.45-{}", machine_fingerprint()),
            )
            .json(&KiroRefreshRequest {
                refresh_token: refresh_token.clone(),
            })
            .send()
            .await
            .context("Failed to send Kiro Desktop refresh request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Kiro Desktop refresh failed: {} - {}", status, error_text);
        }

        let data: KiroRefreshResponse = response
            .json()
            .await
            .context("Failed to parse Kiro Desktop refresh response")?;

        if data.access_token.is_empty() {
            anyhow::bail!("Kiro Desktop response does not contain accessToken");
        }

        Ok(TokenData {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at: expires_at_from(data.expires_in),
            profile_arn: data.profile_arn,
        })
    }

    async fn refresh_sso_oidc(&self, credential: &Credential) -> Result<TokenData> {
        let refresh_token = credential
            .refresh_token
            .as_ref()
            .context("OAuth credential has no refresh token")?;
        let client_id = credential
            .meta_str("client_id")
            .context("Client ID is required for AWS SSO OIDC")?;
        let client_secret = credential
            .meta_str("client_secret")
            .context("Client secret is required for AWS SSO OIDC")?;
        // OIDC endpoint region can differ from the API region
        let sso_region = credential
            .meta_str("sso_region")
            .or_else(|| credential.meta_str("region"))
            .unwrap_or("us-east-1");

        tracing::info!(
            "Refreshing Kiro credential {} via AWS SSO OIDC",
            credential.id
        );

        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token.as_str()),
        ];

        let response = self
            .client
            .post(sso_oidc_url(sso_region))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&form)
            .send()
            .await
            .context("Failed to send AWS SSO OIDC refresh request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                "AWS SSO OIDC refresh failed: status={}, body={}",
                status,
                error_text
            );
            anyhow::bail!("AWS SSO OIDC refresh failed: {} - {}", status, error_text);
        }

        let data: SsoOidcResponse = response
            .json()
            .await
            .context("Failed to parse AWS SSO OIDC refresh response")?;

        if data.access_token.is_empty() {
            anyhow::bail!("AWS SSO OIDC response does not contain access_token");
        }

        Ok(TokenData {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at: expires_at_from(data.expires_in),
            profile_arn: None,
        })
    }
}

fn expires_at_from(expires_in: Option<u64>) -> DateTime<Utc> {
    let expires_in = expires_in.unwrap_or(3600);
    Utc::now() + Duration::seconds(expires_in as i64 - EXPIRY_BUFFER_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_fingerprint_is_stable() {
        assert_eq!(machine_fingerprint(), machine_fingerprint());
        assert!(!machine_fingerprint().is_empty());
    }

    #[test]
    fn test_refresh_urls() {
        assert_eq!(
            kiro_refresh_url("us-east-1"),
            "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken"
        );
        assert_eq!(
            sso_oidc_url("eu-west-1"),
            "https://oidc.eu-west-1.amazonaws.com/token"
        );
    }

    #[test]
    fn test_expiry_buffer() {
        let at = expires_at_from(Some(3600));
        let delta = at - Utc::now();
        assert!(delta.num_seconds() <= 3540);
        assert!(delta.num_seconds() > 3500);
    }
}
