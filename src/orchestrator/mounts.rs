//! Per-run mount planning and group directory provisioning.
//!
//! Every group gets private session and IPC directories; nothing under
//! `data/` is ever shared between groups. Host credential/config files are
//! copied into the group's session root instead of being bind-mounted, so a
//! sandbox can only damage its own copy.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use super::mount_security::MountValidator;
use crate::config::PathsConfig;
use crate::error::ProvisionError;
use crate::groups::Group;

/// Home directory of the sandbox's internal user.
pub const CONTAINER_HOME: &str = "/home/node";

/// One bind mount handed to the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

impl Mount {
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>, readonly: bool) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            readonly,
        }
    }

    /// `host:container[:ro]` for `-v`.
    pub fn volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.readonly {
            arg.push_str(":ro");
        }
        arg
    }
}

impl std::fmt::Display for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.host_path.display(), self.container_path)?;
        if self.readonly {
            write!(f, " (ro)")?;
        }
        Ok(())
    }
}

/// Group folders namespace host directories, so only `[A-Za-z0-9_-]` is
/// accepted and `global` is reserved for the shared directory.
pub fn validate_group_folder(folder: &str) -> Result<(), ProvisionError> {
    let invalid = |reason: &str| ProvisionError::InvalidGroupFolder {
        folder: folder.to_string(),
        reason: reason.to_string(),
    };
    if folder.is_empty() {
        return Err(invalid("folder name is empty"));
    }
    if !folder
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("only letters, digits, '-' and '_' are allowed"));
    }
    if folder.eq_ignore_ascii_case("global") {
        return Err(invalid("'global' is reserved"));
    }
    Ok(())
}

/// A best-effort provisioning step. Failures are recorded, never fatal.
#[derive(Debug, Clone)]
pub enum ProvisioningStep {
    /// Copy the host OAuth credential file into the session dir (0666).
    CopyCredentials { from: PathBuf, to: PathBuf },
    /// Write the default sandbox `settings.json` unless one exists.
    SeedSettings { path: PathBuf },
    /// Copy each skill directory into the session's `skills/`.
    SyncSkills { from: PathBuf, to: PathBuf },
    /// Copy the host `.claude.json`, or create an empty one (0666).
    CopyClaudeJson { from: PathBuf, to: PathBuf },
    /// Make the session tree writable by the sandbox user (a+rwX).
    NormalizePermissions { dir: PathBuf },
}

impl ProvisioningStep {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CopyCredentials { .. } => "copy_credentials",
            Self::SeedSettings { .. } => "seed_settings",
            Self::SyncSkills { .. } => "sync_skills",
            Self::CopyClaudeJson { .. } => "copy_claude_json",
            Self::NormalizePermissions { .. } => "normalize_permissions",
        }
    }

    /// Destinations live in a tree the sandbox can write to, so a symlink
    /// found at a destination is replaced, never followed.
    fn apply(&self) -> std::io::Result<()> {
        match self {
            Self::CopyCredentials { from, to } => {
                if !from.exists() {
                    return Ok(());
                }
                replace_file(to, &std::fs::read(from)?, 0o666)
            }
            Self::SeedSettings { path } => {
                if is_regular_file(path) {
                    return Ok(());
                }
                let settings = serde_json::json!({
                    "env": {
                        "CLAUDE_CODE_EXPERIMENTAL_AGENT_TEAMS": "1",
                        "CLAUDE_CODE_ADDITIONAL_DIRECTORIES_CLAUDE_MD": "1",
                        "CLAUDE_CODE_DISABLE_AUTO_MEMORY": "0"
                    }
                });
                let mut body = serde_json::to_string_pretty(&settings)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                body.push('\n');
                replace_file(path, body.as_bytes(), 0o644)
            }
            Self::SyncSkills { from, to } => {
                let entries = match std::fs::read_dir(from) {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e),
                };
                ensure_real_dir(to)?;
                for entry in entries {
                    let entry = entry?;
                    if !entry.file_type()?.is_dir() {
                        continue;
                    }
                    let dst = to.join(entry.file_name());
                    ensure_real_dir(&dst)?;
                    copy_dir_recursive(&entry.path(), &dst)?;
                }
                Ok(())
            }
            Self::CopyClaudeJson { from, to } => {
                if from.is_file() {
                    replace_file(to, &std::fs::read(from)?, 0o666)
                } else if is_regular_file(to) {
                    set_mode(to, 0o666)
                } else {
                    replace_file(to, b"{}", 0o666)
                }
            }
            Self::NormalizePermissions { dir } => make_tree_writable(dir),
        }
    }
}

/// Outcome of a [`ProvisioningPlan`].
#[derive(Debug, Clone, Default)]
pub struct ProvisioningReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

impl ProvisioningReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Ordered best-effort steps; each runs even if an earlier one failed.
#[derive(Debug, Clone, Default)]
pub struct ProvisioningPlan {
    steps: Vec<ProvisioningStep>,
}

impl ProvisioningPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: ProvisioningStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[ProvisioningStep] {
        &self.steps
    }

    pub fn execute(&self, group_folder: &str) -> ProvisioningReport {
        let mut report = ProvisioningReport::default();
        for step in &self.steps {
            match step.apply() {
                Ok(()) => report.completed.push(step.name()),
                Err(e) => {
                    tracing::warn!(
                        group = %group_folder,
                        step = step.name(),
                        "Provisioning step failed (continuing): {}",
                        e
                    );
                    report.failed.push((step.name(), e.to_string()));
                }
            }
        }
        report
    }
}

/// Mounts for one run plus what happened while provisioning them.
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub mounts: Vec<Mount>,
    pub report: ProvisioningReport,
}

/// Computes the isolation boundary for a group's sandbox.
pub struct MountPlanner {
    paths: PathsConfig,
    dev_mount: bool,
    validator: Arc<dyn MountValidator>,
}

impl MountPlanner {
    pub fn new(paths: PathsConfig, dev_mount: bool, validator: Arc<dyn MountValidator>) -> Self {
        Self {
            paths,
            dev_mount,
            validator,
        }
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    /// Provision the group's directories and return its ordered mounts.
    ///
    /// Idempotent. Only failing to create the mandatory group, session or
    /// IPC directories is an error.
    pub fn plan_mounts(&self, group: &Group, is_main: bool) -> Result<MountPlan, ProvisionError> {
        let folder = group.folder.as_str();
        validate_group_folder(folder)?;

        let group_dir = self.paths.group_dir(folder);
        let session_root = self.paths.session_root(folder);
        let session_dir = self.paths.session_dir(folder);
        let ipc_dir = self.paths.ipc_dir(folder);

        ensure_dir(&group_dir)?;
        ensure_dir(&session_dir.join("debug"))?;
        for sub in ["messages", "tasks", "input"] {
            ensure_dir(&ipc_dir.join(sub))?;
        }

        let claude_json = session_root.join(".claude.json");
        let mut plan = ProvisioningPlan::new();
        plan.push(ProvisioningStep::CopyCredentials {
            from: self.paths.host_credentials_file.clone(),
            to: session_dir.join(".credentials.json"),
        });
        plan.push(ProvisioningStep::SeedSettings {
            path: session_dir.join("settings.json"),
        });
        plan.push(ProvisioningStep::SyncSkills {
            from: self.paths.skills_dir.clone(),
            to: session_dir.join("skills"),
        });
        plan.push(ProvisioningStep::CopyClaudeJson {
            from: self.paths.host_claude_json.clone(),
            to: claude_json.clone(),
        });
        plan.push(ProvisioningStep::NormalizePermissions {
            dir: session_dir.clone(),
        });
        let report = plan.execute(folder);

        let mut mounts = Vec::new();
        if is_main {
            mounts.push(Mount::new(&self.paths.project_root, "/workspace/project", false));
            mounts.push(Mount::new(&group_dir, "/workspace/group", false));
        } else {
            mounts.push(Mount::new(&group_dir, "/workspace/group", false));
            let global = self.paths.global_dir();
            if global.is_dir() {
                mounts.push(Mount::new(global, "/workspace/global", true));
            }
        }

        mounts.push(Mount::new(
            &session_dir,
            format!("{}/.claude", CONTAINER_HOME),
            false,
        ));
        mounts.push(Mount::new(&ipc_dir, "/workspace/ipc", false));
        mounts.push(Mount::new(
            claude_json,
            format!("{}/.claude.json", CONTAINER_HOME),
            false,
        ));

        if self.dev_mount {
            mounts.push(Mount::new(self.paths.agent_runner_src(), "/app/src", true));
        }

        mounts.extend(
            self.validator
                .validate(group.additional_mounts(), &group.name, is_main),
        );

        Ok(MountPlan { mounts, report })
    }
}

fn ensure_dir(path: &Path) -> Result<(), ProvisionError> {
    std::fs::create_dir_all(path).map_err(|source| ProvisionError::DirectoryCreation {
        path: path.to_path_buf(),
        source,
    })
}

/// Copy a directory tree, skipping symlinks and unreadable entries.
/// Returns the number of files copied.
fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<usize> {
    let entries = match std::fs::read_dir(src) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!("Skipping unreadable directory {}: {}", src.display(), e);
            return Ok(0);
        }
    };

    let mut copied = 0;
    for entry in entries.flatten() {
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_symlink() {
            tracing::debug!("Skipping symlink {}", src_path.display());
        } else if file_type.is_dir() {
            ensure_real_dir(&dst_path)?;
            copied += copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            let mode = file_mode(&entry.metadata()?);
            replace_file(&dst_path, &std::fs::read(&src_path)?, mode)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_file())
        .unwrap_or(false)
}

/// Make `path` a real directory. A symlink or file in its place is removed.
fn ensure_real_dir(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_dir() => return Ok(()),
        Ok(meta) => {
            tracing::warn!(
                path = %path.display(),
                symlink = meta.file_type().is_symlink(),
                "Replacing non-directory entry in session tree"
            );
            std::fs::remove_file(path)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir(path)?;
    if std::fs::symlink_metadata(path)?.file_type().is_dir() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "{} was replaced while provisioning",
            path.display()
        )))
    }
}

/// Write `bytes` to a temp file next to `to` and rename it into place. The
/// rename swaps out whatever entry sits at `to`, including a symlink, so the
/// link target is never written or chmodded.
fn replace_file(to: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    let parent = match to.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    set_file_mode(tmp.as_file(), mode)?;
    tmp.persist(to).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_file_mode(file: &std::fs::File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_file: &std::fs::File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// `chmod -R a+rwX`: dirs get 0777, files gain rw for everyone and x for
/// everyone if any x bit was set. Symlinks are left alone.
#[cfg(unix)]
fn make_tree_writable(root: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::symlink_metadata(root)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    if meta.is_dir() {
        std::fs::set_permissions(root, std::fs::Permissions::from_mode(mode | 0o777))?;
        for entry in std::fs::read_dir(root)? {
            make_tree_writable(&entry?.path())?;
        }
    } else {
        let exec = if mode & 0o111 != 0 { 0o111 } else { 0 };
        std::fs::set_permissions(root, std::fs::Permissions::from_mode(mode | 0o666 | exec))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_tree_writable(_root: &Path) -> std::io::Result<()> {
    Ok(())
}
