//! Per-run credential resolution and the OAuth/fallback transitions.

use std::path::Path;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;

use super::{
    API_KEY_VAR, FALLBACK_KEY_VAR, FallbackStatus, FallbackStore, OAUTH_TOKEN_VAR,
    OAuthRefresher, SecretMap, THREADS_TOKEN_VAR, ThreadsTokenRefresher, read_env_file,
};
use crate::config::{AuthConfig, Config};
use crate::error::CredentialError;

/// Which primary credential a run was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    OAuth,
    Fallback,
    /// Neither credential was available; the sandbox will fail downstream.
    Unauthenticated,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthMethod::OAuth => "oauth",
            AuthMethod::Fallback => "fallback",
            AuthMethod::Unauthenticated => "none",
        };
        write!(f, "{}", s)
    }
}

/// Secrets for one run plus the method they were resolved with.
#[derive(Debug)]
pub struct ResolvedCredentials {
    pub secrets: SecretMap,
    pub method: AuthMethod,
}

pub struct CredentialProvisioner {
    env_file: std::path::PathBuf,
    passthrough_keys: Vec<String>,
    fallback: FallbackStore,
    oauth: OAuthRefresher,
    threads: ThreadsTokenRefresher,
}

impl CredentialProvisioner {
    pub fn new(auth: &AuthConfig, host_credentials_file: &Path) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(auth.http_timeout)
            .build()?;

        Ok(Self {
            env_file: auth.env_file.clone(),
            passthrough_keys: auth.passthrough_keys.clone(),
            fallback: FallbackStore::new(&auth.fallback_state_file),
            oauth: OAuthRefresher::new(
                client.clone(),
                host_credentials_file,
                &auth.oauth_token_url,
            ),
            threads: ThreadsTokenRefresher::new(
                client,
                &auth.env_file,
                &auth.threads_state_file,
                &auth.threads_refresh_url,
            ),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, CredentialError> {
        Self::new(&config.auth, &config.paths.host_credentials_file)
    }

    pub fn fallback_store(&self) -> &FallbackStore {
        &self.fallback
    }

    pub async fn resolve(&self) -> ResolvedCredentials {
        self.resolve_at(Utc::now()).await
    }

    /// Resolve the secrets for a run starting at `now`.
    ///
    /// The fallback record is read fresh on every call. Exactly one of
    /// `CLAUDE_CODE_OAUTH_TOKEN` / `ANTHROPIC_API_KEY` ends up in the map,
    /// or neither when nothing is available.
    pub async fn resolve_at(&self, now: DateTime<Utc>) -> ResolvedCredentials {
        let mut wanted: Vec<&str> = vec![FALLBACK_KEY_VAR];
        wanted.extend(self.passthrough_keys.iter().map(String::as_str));
        let mut env = read_env_file(&self.env_file, &wanted);
        let fallback_key = env.remove(FALLBACK_KEY_VAR);

        let mut secrets = SecretMap::new();
        for key in &self.passthrough_keys {
            if key == OAUTH_TOKEN_VAR || key == API_KEY_VAR {
                continue;
            }
            if let Some(value) = env.remove(key.as_str()) {
                secrets.insert(key.clone(), value);
            }
        }
        if self.passthrough_keys.iter().any(|k| k == THREADS_TOKEN_VAR)
            && let Some(token) = self.threads.ensure_fresh_token(now).await
        {
            secrets.insert(THREADS_TOKEN_VAR, token.expose_secret());
        }

        match self.fallback.status_at(now) {
            FallbackStatus::Active { remaining, .. } => {
                if let Some(key) = fallback_key.as_deref() {
                    tracing::info!(
                        remaining_min = remaining.as_secs().div_ceil(60),
                        "Auth: fallback mode active, using prepaid API key"
                    );
                    secrets.insert(API_KEY_VAR, key);
                    return ResolvedCredentials {
                        secrets,
                        method: AuthMethod::Fallback,
                    };
                }
                tracing::warn!(
                    "Auth: fallback mode active but {} is not set, trying OAuth",
                    FALLBACK_KEY_VAR
                );
            }
            FallbackStatus::Expired { .. } => {
                tracing::info!("Auth: fallback window elapsed, retrying OAuth");
                self.fallback.clear();
            }
            FallbackStatus::Inactive => {}
        }

        if let Some(token) = self.oauth.ensure_fresh_token(now).await {
            secrets.insert(OAUTH_TOKEN_VAR, token.expose_secret());
            return ResolvedCredentials {
                secrets,
                method: AuthMethod::OAuth,
            };
        }

        match fallback_key {
            Some(key) => {
                tracing::warn!("Auth: OAuth unavailable, switching to prepaid API key");
                self.fallback.enter_fallback(now);
                secrets.insert(API_KEY_VAR, key);
                ResolvedCredentials {
                    secrets,
                    method: AuthMethod::Fallback,
                }
            }
            None => {
                tracing::warn!("Auth: no OAuth token and no fallback key; running without a model credential");
                ResolvedCredentials {
                    secrets,
                    method: AuthMethod::Unauthenticated,
                }
            }
        }
    }

    pub fn record_run_outcome(&self, method: AuthMethod, rate_limited: bool, clean_exit: bool) {
        self.record_run_outcome_at(Utc::now(), method, rate_limited, clean_exit);
    }

    /// Post-run transitions. Only OAuth runs move the state machine: a
    /// rate limit enters fallback, a clean exit without one clears it.
    pub fn record_run_outcome_at(
        &self,
        now: DateTime<Utc>,
        method: AuthMethod,
        rate_limited: bool,
        clean_exit: bool,
    ) {
        if method != AuthMethod::OAuth {
            return;
        }
        if rate_limited {
            self.fallback.enter_fallback(now);
        } else if clean_exit {
            self.fallback.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::FALLBACK_DURATION;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        provisioner: CredentialProvisioner,
    }

    fn fixture(env: &str, oauth_valid_for: Option<Duration>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::write(root.join(".env"), env).unwrap();

        let creds = root.join("home").join(".claude").join(".credentials.json");
        if let Some(valid_for) = oauth_valid_for {
            std::fs::create_dir_all(creds.parent().unwrap()).unwrap();
            let expires_at = Utc::now().timestamp_millis() + valid_for.as_millis() as i64;
            let json = serde_json::json!({
                "claudeAiOauth": {
                    "accessToken": "oauth-token",
                    "refreshToken": "rt",
                    "expiresAt": expires_at
                }
            });
            std::fs::write(&creds, json.to_string()).unwrap();
        }

        let mut auth = AuthConfig::rooted_at(&root, root.join("data"));
        auth.oauth_token_url = "http://127.0.0.1:9/token".to_string();
        auth.threads_refresh_url = "http://127.0.0.1:9/refresh".to_string();
        let provisioner = CredentialProvisioner::new(&auth, &creds).unwrap();
        Fixture {
            _dir: dir,
            root,
            provisioner,
        }
    }

    fn assert_single_credential(secrets: &SecretMap) {
        assert!(!(secrets.contains_key(OAUTH_TOKEN_VAR) && secrets.contains_key(API_KEY_VAR)));
        assert!(!secrets.contains_key(FALLBACK_KEY_VAR));
    }

    #[tokio::test]
    async fn test_oauth_preferred_when_healthy() {
        let f = fixture(
            "ANTHROPIC_API_KEY_FALLBACK=sk-fb\n",
            Some(Duration::from_secs(3600)),
        );
        let resolved = f.provisioner.resolve_at(Utc::now()).await;

        assert_eq!(resolved.method, AuthMethod::OAuth);
        assert_eq!(resolved.secrets.expose(OAUTH_TOKEN_VAR), Some("oauth-token"));
        assert_single_credential(&resolved.secrets);
    }

    #[tokio::test]
    async fn test_active_window_short_circuits_repeatedly() {
        let f = fixture(
            "ANTHROPIC_API_KEY_FALLBACK=sk-fb\n",
            Some(Duration::from_secs(3600)),
        );
        let start = Utc::now();
        f.provisioner.fallback_store().enter_fallback(start);

        for minutes in [0, 30, 120, 299] {
            let now = start + chrono::Duration::minutes(minutes);
            let resolved = f.provisioner.resolve_at(now).await;
            assert_eq!(resolved.method, AuthMethod::Fallback);
            assert_eq!(resolved.secrets.expose(API_KEY_VAR), Some("sk-fb"));
            assert_single_credential(&resolved.secrets);
        }
        assert!(f.provisioner.fallback_store().load().fallback_since.is_some());
    }

    #[tokio::test]
    async fn test_expired_window_clears_and_uses_oauth() {
        let f = fixture(
            "ANTHROPIC_API_KEY_FALLBACK=sk-fb\n",
            Some(Duration::from_secs(10 * 3600)),
        );
        let now = Utc::now();
        let since = now - chrono::Duration::from_std(FALLBACK_DURATION).unwrap();
        f.provisioner.fallback_store().enter_fallback(since);

        let resolved = f.provisioner.resolve_at(now).await;

        assert_eq!(resolved.method, AuthMethod::OAuth);
        assert_eq!(f.provisioner.fallback_store().load().fallback_since, None);
    }

    #[tokio::test]
    async fn test_oauth_unavailable_enters_fallback() {
        let f = fixture("ANTHROPIC_API_KEY_FALLBACK=sk-fb\n", None);
        let now = Utc::now();

        let resolved = f.provisioner.resolve_at(now).await;

        assert_eq!(resolved.method, AuthMethod::Fallback);
        assert_eq!(resolved.secrets.expose(API_KEY_VAR), Some("sk-fb"));
        assert_eq!(
            f.provisioner.fallback_store().load().fallback_since,
            Some(now.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_nothing_available_is_unauthenticated() {
        let f = fixture("", None);
        let resolved = f.provisioner.resolve_at(Utc::now()).await;

        assert_eq!(resolved.method, AuthMethod::Unauthenticated);
        assert!(resolved.secrets.is_empty());
        assert_eq!(f.provisioner.fallback_store().load().fallback_since, None);
    }

    #[tokio::test]
    async fn test_active_window_without_key_tries_oauth_and_keeps_record() {
        let f = fixture("", Some(Duration::from_secs(3600)));
        let now = Utc::now();
        f.provisioner.fallback_store().enter_fallback(now);

        let resolved = f.provisioner.resolve_at(now).await;

        assert_eq!(resolved.method, AuthMethod::OAuth);
        assert!(f.provisioner.fallback_store().load().fallback_since.is_some());
    }

    #[tokio::test]
    async fn test_passthrough_secrets_included() {
        let f = fixture(
            "THREADS_USER_ID=42\nTHREADS_ACCESS_TOKEN=th-tok\nUNRELATED=x\n",
            Some(Duration::from_secs(3600)),
        );
        let resolved = f.provisioner.resolve_at(Utc::now()).await;

        assert_eq!(resolved.secrets.expose("THREADS_USER_ID"), Some("42"));
        assert_eq!(resolved.secrets.expose(THREADS_TOKEN_VAR), Some("th-tok"));
        assert!(!resolved.secrets.contains_key("UNRELATED"));
        assert!(f.root.join("data").join("threads-token-state.json").exists());
    }

    #[test]
    fn test_record_run_outcome_transitions() {
        let f = fixture("", None);
        let store = f.provisioner.fallback_store();
        let now = Utc::now();

        f.provisioner
            .record_run_outcome_at(now, AuthMethod::Fallback, true, false);
        assert_eq!(store.load().fallback_since, None);

        f.provisioner
            .record_run_outcome_at(now, AuthMethod::OAuth, true, true);
        assert_eq!(store.load().fallback_since, Some(now.timestamp_millis()));

        f.provisioner
            .record_run_outcome_at(now, AuthMethod::OAuth, false, false);
        assert!(store.load().fallback_since.is_some());

        f.provisioner
            .record_run_outcome_at(now, AuthMethod::OAuth, false, true);
        assert_eq!(store.load().fallback_since, None);
    }
}
