//! Long-lived Threads API token refresh.
//!
//! The token is configured in the env file. Its assumed expiry is tracked in
//! a small state file; within seven days of expiry the token is exchanged
//! for a new one, which is written back to both the state file and the env
//! file so it survives restarts.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::oauth::format_epoch_ms;
use crate::error::CredentialError;

/// Refresh this long before the assumed expiry.
pub const THREADS_REFRESH_MARGIN: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Validity assumed for a token first seen in the env file.
pub const THREADS_ASSUMED_VALIDITY: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// Persisted `{accessToken, expiresAt, lastRefreshAt}` record (epoch ms).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsTokenState {
    pub access_token: String,
    pub expires_at: i64,
    pub last_refresh_at: i64,
}

impl std::fmt::Debug for ThreadsTokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadsTokenState")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("last_refresh_at", &self.last_refresh_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct ThreadsTokenRefresher {
    client: reqwest::Client,
    env_file: PathBuf,
    state_file: PathBuf,
    refresh_url: String,
}

impl ThreadsTokenRefresher {
    pub fn new(
        client: reqwest::Client,
        env_file: impl Into<PathBuf>,
        state_file: impl Into<PathBuf>,
        refresh_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            env_file: env_file.into(),
            state_file: state_file.into(),
            refresh_url: refresh_url.into(),
        }
    }

    pub fn load_state(&self) -> Option<ThreadsTokenState> {
        let raw = std::fs::read_to_string(&self.state_file).ok()?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::debug!("Ignoring unreadable Threads token state: {}", e);
                None
            }
        }
    }

    /// Current or refreshed token, or `None` when no token is configured.
    pub async fn ensure_fresh_token(&self, now: DateTime<Utc>) -> Option<SecretString> {
        let configured = super::read_env_file(&self.env_file, &[super::THREADS_TOKEN_VAR])
            .remove(super::THREADS_TOKEN_VAR)?;
        let now_ms = now.timestamp_millis();

        let state = match self.load_state() {
            Some(state) if state.access_token == configured => state,
            _ => {
                // First sighting, or the token was replaced by hand.
                let seeded = ThreadsTokenState {
                    access_token: configured.clone(),
                    expires_at: now_ms + THREADS_ASSUMED_VALIDITY.as_millis() as i64,
                    last_refresh_at: now_ms,
                };
                if let Err(e) = self.save_state(&seeded) {
                    tracing::warn!("Failed to seed Threads token state: {}", e);
                }
                return Some(SecretString::from(configured));
            }
        };

        let remaining_ms = state.expires_at.saturating_sub(now_ms);
        if remaining_ms > THREADS_REFRESH_MARGIN.as_millis() as i64 {
            return Some(SecretString::from(state.access_token));
        }

        tracing::info!(
            expires_at = %format_epoch_ms(state.expires_at),
            days_left = remaining_ms / (24 * 60 * 60 * 1000),
            "Threads token expiring soon, refreshing"
        );

        let (token, expires_in) = match self.request_refresh(&state.access_token).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Threads token refresh failed, using existing token: {}", e);
                return Some(SecretString::from(state.access_token));
            }
        };

        let refreshed = ThreadsTokenState {
            access_token: token,
            expires_at: now_ms.saturating_add(expires_in.saturating_mul(1000)),
            last_refresh_at: now_ms,
        };
        if let Err(e) = self.save_state(&refreshed) {
            tracing::error!("Failed to persist Threads token state: {}", e);
        }
        if let Err(e) = super::update_env_value(
            &self.env_file,
            super::THREADS_TOKEN_VAR,
            &refreshed.access_token,
        ) {
            tracing::warn!("Failed to update {} in env file: {}", super::THREADS_TOKEN_VAR, e);
        }

        tracing::info!(
            expires_at = %format_epoch_ms(refreshed.expires_at),
            days_valid = expires_in / 86_400,
            "Threads token refreshed"
        );
        Some(SecretString::from(refreshed.access_token))
    }

    fn save_state(&self, state: &ThreadsTokenState) -> Result<(), CredentialError> {
        let mut body =
            serde_json::to_string_pretty(state).map_err(|e| CredentialError::Malformed {
                path: self.state_file.clone(),
                reason: e.to_string(),
            })?;
        body.push('\n');
        super::write_atomic(&self.state_file, body.as_bytes()).map_err(|source| {
            CredentialError::Io {
                path: self.state_file.clone(),
                source,
            }
        })
    }

    async fn request_refresh(&self, current: &str) -> Result<(String, i64), CredentialError> {
        let response = self
            .client
            .get(&self.refresh_url)
            .query(&[("grant_type", "th_refresh_token"), ("access_token", current)])
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
        match parsed.access_token.filter(|t| !t.is_empty()) {
            Some(token) => Ok((
                token,
                parsed
                    .expires_in
                    .unwrap_or(THREADS_ASSUMED_VALIDITY.as_secs() as i64),
            )),
            None => Err(CredentialError::InvalidResponse(
                "response carried no access_token".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    const DEAD_URL: &str = "http://127.0.0.1:9/refresh_access_token";

    fn refresher(dir: &std::path::Path) -> ThreadsTokenRefresher {
        ThreadsTokenRefresher::new(
            reqwest::Client::new(),
            dir.join(".env"),
            dir.join("data").join("threads-token-state.json"),
            DEAD_URL,
        )
    }

    #[tokio::test]
    async fn test_unconfigured_token_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(refresher(dir.path()).ensure_fresh_token(Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn test_new_token_seeds_sixty_day_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "THREADS_ACCESS_TOKEN=tok-1\n").unwrap();
        let r = refresher(dir.path());
        let now = Utc::now();

        let token = r.ensure_fresh_token(now).await.unwrap();
        assert_eq!(token.expose_secret(), "tok-1");

        let state = r.load_state().unwrap();
        assert_eq!(state.access_token, "tok-1");
        assert_eq!(
            state.expires_at - now.timestamp_millis(),
            THREADS_ASSUMED_VALIDITY.as_millis() as i64
        );
    }

    #[tokio::test]
    async fn test_externally_changed_token_reseeds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "THREADS_ACCESS_TOKEN=tok-new\n").unwrap();
        let r = refresher(dir.path());
        let now = Utc::now();
        r.save_state(&ThreadsTokenState {
            access_token: "tok-old".to_string(),
            expires_at: now.timestamp_millis() + 1000,
            last_refresh_at: 0,
        })
        .unwrap();

        let token = r.ensure_fresh_token(now).await.unwrap();
        assert_eq!(token.expose_secret(), "tok-new");
        assert_eq!(r.load_state().unwrap().last_refresh_at, now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_last_known_token() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "THREADS_ACCESS_TOKEN=tok-1\n").unwrap();
        let r = refresher(dir.path());
        let now = Utc::now();
        let near_expiry = ThreadsTokenState {
            access_token: "tok-1".to_string(),
            expires_at: now.timestamp_millis() + 24 * 60 * 60 * 1000,
            last_refresh_at: 0,
        };
        r.save_state(&near_expiry).unwrap();

        let token = r.ensure_fresh_token(now).await.unwrap();
        assert_eq!(token.expose_secret(), "tok-1");
        assert_eq!(r.load_state().unwrap(), near_expiry);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".env")).unwrap(),
            "THREADS_ACCESS_TOKEN=tok-1\n"
        );
    }
}
