use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_list_env, parse_string_env};
use crate::error::ConfigError;

pub const DEFAULT_OAUTH_TOKEN_URL: &str = "https://claude.ai/oauth/token";
pub const DEFAULT_THREADS_REFRESH_URL: &str = "https://graph.threads.net/refresh_access_token";

/// Secrets forwarded to the sandbox untouched when present in the env file.
const DEFAULT_PASSTHROUGH_KEYS: &[&str] = &["THREADS_ACCESS_TOKEN", "THREADS_USER_ID"];

/// Credential resolution settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// `.env` file holding the fallback key and passthrough secrets.
    pub env_file: PathBuf,
    /// Persisted `{fallbackSince}` record.
    pub fallback_state_file: PathBuf,
    /// Persisted social-token state.
    pub threads_state_file: PathBuf,
    pub oauth_token_url: String,
    pub threads_refresh_url: String,
    pub passthrough_keys: Vec<String>,
    pub http_timeout: Duration,
}

impl AuthConfig {
    pub fn rooted_at(root: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            env_file: root.as_ref().join(".env"),
            fallback_state_file: data_dir.join("auth-state.json"),
            threads_state_file: data_dir.join("threads-token-state.json"),
            oauth_token_url: DEFAULT_OAUTH_TOKEN_URL.to_string(),
            threads_refresh_url: DEFAULT_THREADS_REFRESH_URL.to_string(),
            passthrough_keys: DEFAULT_PASSTHROUGH_KEYS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            http_timeout: Duration::from_secs(30),
        }
    }

    pub(crate) fn resolve(root: &Path, data_dir: &Path) -> Result<Self, ConfigError> {
        let mut auth = Self::rooted_at(root, data_dir);
        if let Some(file) = optional_env("GROUPCLAW_ENV_FILE")? {
            auth.env_file = PathBuf::from(file);
        }
        auth.oauth_token_url = parse_string_env("OAUTH_TOKEN_URL", auth.oauth_token_url)?;
        auth.threads_refresh_url =
            parse_string_env("THREADS_REFRESH_URL", auth.threads_refresh_url)?;
        auth.passthrough_keys =
            parse_list_env("SANDBOX_PASSTHROUGH_SECRETS", DEFAULT_PASSTHROUGH_KEYS)?;
        Ok(auth)
    }
}
