//! Configuration for groupclaw.
//!
//! Everything is resolved from environment variables with sensible defaults.
//! `./.env` is loaded via dotenvy first; it never overwrites variables that
//! are already set in the process environment.

mod auth;
pub(crate) mod helpers;
mod paths;
mod sandbox;

pub use self::auth::{AuthConfig, DEFAULT_OAUTH_TOKEN_URL, DEFAULT_THREADS_REFRESH_URL};
pub use self::paths::PathsConfig;
pub use self::sandbox::SandboxConfig;

use crate::error::ConfigError;

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub paths: PathsConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let paths = PathsConfig::resolve()?;
        let auth = AuthConfig::resolve(&paths.project_root, &paths.data_dir)?;
        let sandbox = SandboxConfig::resolve()?;

        tracing::debug!(
            project_root = %paths.project_root.display(),
            image = %sandbox.image,
            "Resolved configuration"
        );

        Ok(Self {
            sandbox,
            paths,
            auth,
        })
    }

    /// Self-contained configuration rooted at `root`, with `home` standing in
    /// for the user's home directory.
    pub fn rooted_at(root: impl Into<std::path::PathBuf>, home: impl AsRef<std::path::Path>) -> Self {
        let paths = PathsConfig::rooted_at(root, home);
        let auth = AuthConfig::rooted_at(&paths.project_root, &paths.data_dir);
        Self {
            sandbox: SandboxConfig::default(),
            paths,
            auth,
        }
    }
}
