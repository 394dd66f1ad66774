//! Validation of group-requested extra mounts against a host allowlist.
//!
//! The allowlist lives outside the project tree (default
//! `~/.config/groupclaw/mount-allowlist.json`) so no sandbox can edit it:
//!
//! ```json
//! {
//!   "allowedRoots": [
//!     { "path": "~/projects", "allowReadWrite": true, "description": "code" }
//!   ],
//!   "blockedPatterns": ["secrets"],
//!   "nonMainReadOnly": true
//! }
//! ```
//!
//! Without an allowlist file every extra mount is rejected.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use super::mounts::Mount;
use crate::groups::AdditionalMount;

/// Path fragments that are never mountable, whatever the allowlist says.
const BUILTIN_BLOCKED_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".gpg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    ".env",
    ".netrc",
    ".npmrc",
    "credentials",
    "id_rsa",
    "id_ed25519",
    "private_key",
];

const EXTRA_MOUNT_ROOT: &str = "/workspace/extra";

/// Decides which requested extra mounts a group actually gets.
pub trait MountValidator: Send + Sync {
    fn validate(&self, requested: &[AdditionalMount], group_name: &str, is_main: bool)
    -> Vec<Mount>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountAllowlist {
    #[serde(default)]
    pub allowed_roots: Vec<AllowedRoot>,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default = "default_non_main_read_only")]
    pub non_main_read_only: bool,
}

fn default_non_main_read_only() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRoot {
    pub path: String,
    #[serde(default)]
    pub allow_read_write: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// File-backed allowlist validator. The file is re-read on every call.
#[derive(Debug, Clone)]
pub struct AllowlistMountValidator {
    allowlist_path: PathBuf,
    home: Option<PathBuf>,
}

impl AllowlistMountValidator {
    pub fn new(allowlist_path: impl Into<PathBuf>) -> Self {
        Self {
            allowlist_path: allowlist_path.into(),
            home: dirs::home_dir(),
        }
    }

    /// Use `home` for `~` expansion instead of the real home directory.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    fn load(&self) -> Option<MountAllowlist> {
        let raw = match std::fs::read_to_string(&self.allowlist_path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    path = %self.allowlist_path.display(),
                    "Mount allowlist not readable ({}); rejecting extra mounts",
                    e
                );
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(list) => Some(list),
            Err(e) => {
                tracing::warn!(
                    path = %self.allowlist_path.display(),
                    "Invalid mount allowlist ({}); rejecting extra mounts",
                    e
                );
                None
            }
        }
    }

    fn expand(&self, raw: &str) -> PathBuf {
        match (raw.strip_prefix('~'), &self.home) {
            (Some(""), Some(home)) => home.clone(),
            (Some(rest), Some(home)) if rest.starts_with('/') => {
                home.join(rest.trim_start_matches('/'))
            }
            _ => PathBuf::from(raw),
        }
    }

    fn check(
        &self,
        allowlist: &MountAllowlist,
        mount: &AdditionalMount,
        is_main: bool,
    ) -> Result<Mount, String> {
        let host = self
            .expand(&mount.host_path)
            .canonicalize()
            .map_err(|e| format!("host path not accessible: {}", e))?;

        let name = match &mount.container_path {
            Some(p) => p.clone(),
            None => host
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        validate_container_name(&name)?;

        if let Some(pattern) = blocked_pattern(&host, &allowlist.blocked_patterns) {
            return Err(format!("path matches blocked pattern '{}'", pattern));
        }

        let root = allowlist
            .allowed_roots
            .iter()
            .find(|root| {
                self.expand(&root.path)
                    .canonicalize()
                    .map(|r| host.starts_with(r))
                    .unwrap_or(false)
            })
            .ok_or_else(|| "path is not under any allowed root".to_string())?;

        let readonly = mount.readonly
            || !root.allow_read_write
            || (!is_main && allowlist.non_main_read_only);

        Ok(Mount::new(
            host,
            format!("{}/{}", EXTRA_MOUNT_ROOT, name),
            readonly,
        ))
    }
}

impl MountValidator for AllowlistMountValidator {
    fn validate(
        &self,
        requested: &[AdditionalMount],
        group_name: &str,
        is_main: bool,
    ) -> Vec<Mount> {
        if requested.is_empty() {
            return Vec::new();
        }
        let Some(allowlist) = self.load() else {
            return Vec::new();
        };

        let mut accepted = Vec::with_capacity(requested.len());
        for mount in requested {
            match self.check(&allowlist, mount, is_main) {
                Ok(m) => {
                    tracing::debug!(
                        group = %group_name,
                        host = %m.host_path.display(),
                        container = %m.container_path,
                        readonly = m.readonly,
                        "Extra mount accepted"
                    );
                    accepted.push(m);
                }
                Err(reason) => {
                    tracing::warn!(
                        group = %group_name,
                        host = %mount.host_path,
                        "Extra mount rejected: {}",
                        reason
                    );
                }
            }
        }
        accepted
    }
}

fn validate_container_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("empty container path".to_string());
    }
    if name.contains(':') {
        return Err(format!("container path '{}' contains ':'", name));
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(format!("container path '{}' must be relative", name));
    }
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(format!("container path '{}' must not contain '..'", name));
    }
    Ok(())
}

fn blocked_pattern<'a>(host: &Path, extra: &'a [String]) -> Option<&'a str> {
    let components: Vec<String> = host
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    BUILTIN_BLOCKED_PATTERNS
        .iter()
        .copied()
        .chain(extra.iter().map(String::as_str))
        .filter(|p| !p.is_empty())
        .find(|pattern| components.iter().any(|c| c.contains(pattern)))
}
