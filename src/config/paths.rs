use std::path::{Path, PathBuf};

use crate::config::helpers::optional_env;
use crate::error::ConfigError;

/// Host-side filesystem layout.
///
/// ```text
/// <project_root>/
///   groups/<folder>/          group working dir (+ logs/)
///   groups/global/            shared read-only memory for non-main groups
///   data/sessions/<folder>/   private .claude/ and .claude.json per group
///   data/ipc/<folder>/        private IPC tree (messages/, tasks/, input/)
///   container/skills/         skill dirs synced into each session
///   container/agent-runner/src/  live sources for DEV_MOUNT
/// ```
#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub project_root: PathBuf,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Host OAuth credential file (`~/.claude/.credentials.json`).
    pub host_credentials_file: PathBuf,
    /// Host CLI config file (`~/.claude.json`).
    pub host_claude_json: PathBuf,
    pub skills_dir: PathBuf,
    /// Extra-mount allowlist. Lives outside the project so a sandbox with
    /// project access cannot rewrite it.
    pub mount_allowlist: PathBuf,
}

impl PathsConfig {
    /// Default layout for a project rooted at `root` with the given home dir.
    pub fn rooted_at(root: impl Into<PathBuf>, home: impl AsRef<Path>) -> Self {
        let root = root.into();
        let home = home.as_ref();
        Self {
            groups_dir: root.join("groups"),
            data_dir: root.join("data"),
            host_credentials_file: home.join(".claude").join(".credentials.json"),
            host_claude_json: home.join(".claude.json"),
            skills_dir: root.join("container").join("skills"),
            mount_allowlist: home
                .join(".config")
                .join("groupclaw")
                .join("mount-allowlist.json"),
            project_root: root,
        }
    }

    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let root = match optional_env("GROUPCLAW_PROJECT_ROOT")? {
            Some(p) => PathBuf::from(p),
            None => std::env::current_dir().map_err(|e| ConfigError::InvalidValue {
                key: "GROUPCLAW_PROJECT_ROOT".to_string(),
                message: format!("could not determine working directory: {e}"),
            })?,
        };
        let home = dirs::home_dir().ok_or_else(|| ConfigError::MissingRequired {
            key: "HOME".to_string(),
            hint: "Set HOME so host credential files can be located.".to_string(),
        })?;

        let mut paths = Self::rooted_at(root, &home);
        if let Some(dir) = optional_env("GROUPCLAW_GROUPS_DIR")? {
            paths.groups_dir = PathBuf::from(dir);
        }
        if let Some(dir) = optional_env("GROUPCLAW_DATA_DIR")? {
            paths.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = optional_env("CLAUDE_CONFIG_DIR")? {
            paths.host_credentials_file = PathBuf::from(dir).join(".credentials.json");
        }
        if let Some(file) = optional_env("CLAUDE_JSON_PATH")? {
            paths.host_claude_json = PathBuf::from(file);
        }
        if let Some(file) = optional_env("MOUNT_ALLOWLIST_PATH")? {
            paths.mount_allowlist = PathBuf::from(file);
        }
        Ok(paths)
    }

    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir.join(folder)
    }

    pub fn global_dir(&self) -> PathBuf {
        self.groups_dir.join("global")
    }

    pub fn logs_dir(&self, folder: &str) -> PathBuf {
        self.group_dir(folder).join("logs")
    }

    /// Per-group session root holding `.claude/` and `.claude.json`.
    pub fn session_root(&self, folder: &str) -> PathBuf {
        self.data_dir.join("sessions").join(folder)
    }

    pub fn session_dir(&self, folder: &str) -> PathBuf {
        self.session_root(folder).join(".claude")
    }

    pub fn ipc_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("ipc").join(folder)
    }

    pub fn agent_runner_src(&self) -> PathBuf {
        self.project_root
            .join("container")
            .join("agent-runner")
            .join("src")
    }
}
