//! Registered group identities.
//!
//! Groups are owned by the registration subsystem; the orchestrator only
//! reads them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A durable conversation/workspace identity with its own sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Human-readable name (used in logs and allowlist checks).
    pub name: String,
    /// Stable folder name; namespaces every per-group directory.
    pub folder: String,
    #[serde(default)]
    pub container_config: Option<ContainerConfig>,
}

impl Group {
    pub fn new(name: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folder: folder.into(),
            container_config: None,
        }
    }

    pub fn with_container_config(mut self, config: ContainerConfig) -> Self {
        self.container_config = Some(config);
        self
    }

    /// Per-group hard timeout override, if any.
    pub fn timeout_override(&self) -> Option<Duration> {
        self.container_config
            .as_ref()
            .and_then(|c| c.timeout_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn additional_mounts(&self) -> &[AdditionalMount] {
        self.container_config
            .as_ref()
            .map(|c| c.additional_mounts.as_slice())
            .unwrap_or(&[])
    }
}

/// Optional per-group sandbox overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub additional_mounts: Vec<AdditionalMount>,
}

/// An extra host directory a group asks to have mounted. Only honored after
/// the allowlist validator approves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalMount {
    pub host_path: String,
    /// Name under `/workspace/extra/`. Defaults to the host dir's basename.
    #[serde(default)]
    pub container_path: Option<String>,
    /// Requested read-only; defaults to true.
    #[serde(default = "default_readonly")]
    pub readonly: bool,
}

fn default_readonly() -> bool {
    true
}

/// Reduce a folder name to `[A-Za-z0-9-]` for use in container names.
pub fn sanitize_for_container_name(folder: &str) -> String {
    let sanitized: String = folder
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "group".to_string()
    } else {
        sanitized
    }
}
