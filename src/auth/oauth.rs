//! Subscription OAuth token refresh.
//!
//! Reads the host CLI's credential file, refreshes the access token when it
//! is close to expiry and writes the new tokens back. Any failure yields the
//! existing (possibly stale) token instead of an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::CredentialError;

/// Refresh when the token expires within this margin.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "claudeAiOauth", default, skip_serializing_if = "Option::is_none")]
    claude_ai_oauth: Option<OAuthCredentials>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// `scopes`, `subscriptionType`, `rateLimitTier` and anything else the
/// identity client stores ride along in `extra` untouched.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthCredentials {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    /// Epoch milliseconds.
    expires_at: i64,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Seconds.
    expires_in: i64,
}

/// Keeps the subscription access token fresh.
pub struct OAuthRefresher {
    client: reqwest::Client,
    credentials_path: PathBuf,
    token_url: String,
}

impl OAuthRefresher {
    pub fn new(
        client: reqwest::Client,
        credentials_path: impl Into<PathBuf>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            credentials_path: credentials_path.into(),
            token_url: token_url.into(),
        }
    }

    pub fn credentials_path(&self) -> &Path {
        &self.credentials_path
    }

    /// Current or refreshed access token, or `None` when no subscription
    /// credentials exist.
    pub async fn ensure_fresh_token(&self, now: DateTime<Utc>) -> Option<SecretString> {
        let mut creds = match self.read_credentials() {
            Ok(creds) => creds,
            Err(CredentialError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                tracing::debug!(
                    path = %self.credentials_path.display(),
                    "No OAuth credential file"
                );
                return None;
            }
            Err(e) => {
                tracing::warn!("Failed to read OAuth credentials: {}", e);
                return None;
            }
        };
        let oauth = creds.claude_ai_oauth.as_mut()?;
        if oauth.access_token.is_empty() {
            return None;
        }

        let now_ms = now.timestamp_millis();
        if oauth.expires_at.saturating_sub(now_ms) > REFRESH_MARGIN.as_millis() as i64 {
            return Some(SecretString::from(oauth.access_token.clone()));
        }

        tracing::info!(
            expires_at = %format_epoch_ms(oauth.expires_at),
            "OAuth token expiring soon, refreshing"
        );

        let Some(refresh_token) = oauth.refresh_token.clone().filter(|t| !t.is_empty()) else {
            tracing::warn!("OAuth token expiring soon but no refresh token is stored, using existing token");
            return Some(SecretString::from(oauth.access_token.clone()));
        };

        let refreshed = match self.request_refresh(&refresh_token).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("OAuth token refresh failed, using existing token: {}", e);
                return Some(SecretString::from(oauth.access_token.clone()));
            }
        };

        oauth.access_token = refreshed.access_token;
        if let Some(refresh_token) = refreshed.refresh_token.filter(|t| !t.is_empty()) {
            oauth.refresh_token = Some(refresh_token);
        }
        oauth.expires_at = now_ms.saturating_add(refreshed.expires_in.saturating_mul(1000));
        let token = SecretString::from(oauth.access_token.clone());
        let expires_at = oauth.expires_at;

        // The new token is valid even if it cannot be persisted.
        if let Err(e) = self.write_credentials(&creds) {
            tracing::error!("Failed to persist refreshed OAuth credentials: {}", e);
        } else {
            tracing::info!(
                expires_at = %format_epoch_ms(expires_at),
                "OAuth token refreshed"
            );
        }
        Some(token)
    }

    fn read_credentials(&self) -> Result<CredentialsFile, CredentialError> {
        let raw = std::fs::read_to_string(&self.credentials_path).map_err(|source| {
            CredentialError::Io {
                path: self.credentials_path.clone(),
                source,
            }
        })?;
        serde_json::from_str(&raw).map_err(|e| CredentialError::Malformed {
            path: self.credentials_path.clone(),
            reason: e.to_string(),
        })
    }

    fn write_credentials(&self, creds: &CredentialsFile) -> Result<(), CredentialError> {
        let mut body =
            serde_json::to_string_pretty(creds).map_err(|e| CredentialError::Malformed {
                path: self.credentials_path.clone(),
                reason: e.to_string(),
            })?;
        body.push('\n');
        super::write_atomic(&self.credentials_path, body.as_bytes()).map_err(|source| {
            CredentialError::Io {
                path: self.credentials_path.clone(),
                source,
            }
        })
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<RefreshResponse, CredentialError> {
        let response = self
            .client
            .post(&self.token_url)
            .json(&RefreshRequest {
                grant_type: "refresh_token",
                refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CredentialError::Status {
                status: status.as_u16(),
                body: super::preview_body(&body),
            });
        }

        let parsed: RefreshResponse = serde_json::from_str(&body)
            .map_err(|e| CredentialError::InvalidResponse(format!("JSON parse error: {}", e)))?;
        if parsed.access_token.is_empty() {
            return Err(CredentialError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }
        Ok(parsed)
    }
}

pub(crate) fn format_epoch_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}
