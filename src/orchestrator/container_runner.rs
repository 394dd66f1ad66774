//! One sandbox run from start to finish.
//!
//! `run()` provisions the group's mounts, resolves credentials, spawns the
//! container runtime, feeds it the input on stdin, supervises it and turns
//! what happened into a [`RunResult`]:
//!
//! | How it ended                      | Result                                   |
//! |-----------------------------------|------------------------------------------|
//! | timeout, streamed output seen     | success, `result: null` (idle cleanup)   |
//! | timeout, no streamed output       | error `Container timed out after {ms}ms` |
//! | exit 0, streaming                 | success, `result: null`                  |
//! | exit 0, legacy                    | last marker pair / last line of stdout   |
//! | non-zero exit                     | error with code and stderr tail          |
//! | spawn failure                     | error `Container spawn error: ...`       |

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::delivery::{OutputDelivery, OutputSink};
use super::mount_security::AllowlistMountValidator;
use super::mounts::{CONTAINER_HOME, Mount, MountPlanner};
use super::protocol::{ContainerInput, ContainerOutput, RunResult, parse_legacy_output};
use super::run_log::{RunLogEntry, write_run_log};
use super::supervisor::{SuperviseOptions, SupervisedRun, Termination, supervise};
use crate::auth::{AuthMethod, CredentialProvisioner};
use crate::config::{Config, SandboxConfig};
use crate::error::{CredentialError, SandboxError};
use crate::groups::{Group, sanitize_for_container_name};

/// Uid of the sandbox image's internal user. No `--user` mapping is needed
/// when the host user already matches it.
const CONTAINER_UID: u32 = 1000;

/// Characters of stderr carried in a non-zero-exit error.
const STDERR_TAIL_CHARS: usize = 200;

/// Handed to the caller right after the process starts.
#[derive(Debug, Clone, Copy)]
pub struct SpawnedSandbox<'a> {
    pub container_name: &'a str,
    pub pid: Option<u32>,
}

pub struct ContainerRunner {
    config: SandboxConfig,
    planner: MountPlanner,
    credentials: CredentialProvisioner,
}

impl ContainerRunner {
    pub fn new(
        config: SandboxConfig,
        planner: MountPlanner,
        credentials: CredentialProvisioner,
    ) -> Self {
        Self {
            config,
            planner,
            credentials,
        }
    }

    /// Runner wired the standard way: allowlist-validated extra mounts and
    /// credentials from the configured env file.
    pub fn from_config(config: &Config) -> Result<Self, CredentialError> {
        let validator = Arc::new(AllowlistMountValidator::new(&config.paths.mount_allowlist));
        let planner = MountPlanner::new(config.paths.clone(), config.sandbox.dev_mount, validator);
        let credentials = CredentialProvisioner::from_config(config)?;
        Ok(Self::new(config.sandbox.clone(), planner, credentials))
    }

    pub fn sandbox_config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialProvisioner {
        &self.credentials
    }

    /// Run the agent for `group` once.
    ///
    /// With a `sink`, every streamed unit is delivered in order before this
    /// returns and the final result carries no payload of its own. Without
    /// one, the result is parsed from stdout after exit.
    ///
    /// Only fatal provisioning and payload errors are returned as `Err`;
    /// every sandbox-side failure is an error-status [`RunResult`].
    pub async fn run<F>(
        &self,
        group: &Group,
        mut input: ContainerInput,
        on_spawned: F,
        sink: Option<Arc<dyn OutputSink>>,
    ) -> Result<RunResult, SandboxError>
    where
        F: FnOnce(&SpawnedSandbox<'_>) + Send,
    {
        let plan = self.planner.plan_mounts(group, input.is_main)?;
        if !plan.report.is_clean() {
            tracing::debug!(
                group = %group.name,
                completed = plan.report.completed.len(),
                failed = plan.report.failed.len(),
                "Session provisioning incomplete"
            );
        }
        let mounts = plan.mounts;

        let container_name = format!(
            "{}-{}-{}",
            self.config.name_prefix,
            sanitize_for_container_name(&group.folder),
            Utc::now().timestamp_millis()
        );
        let args = build_container_args(&self.config, &mounts, &container_name, host_user());

        tracing::debug!(
            group = %group.name,
            container_name = %container_name,
            mounts = ?mounts.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
            args = %args.join(" "),
            "Container mount configuration"
        );
        tracing::info!(
            group = %group.name,
            container_name = %container_name,
            mount_count = mounts.len(),
            is_main = input.is_main,
            "Spawning container agent"
        );

        let resolved = self.credentials.resolve().await;
        let auth_method = resolved.method;
        let payload = input.encode_with_secrets(resolved.secrets)?;

        let mut child = match Command::new(&self.config.runtime_binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    group = %group.name,
                    container_name = %container_name,
                    "Container spawn error: {}",
                    e
                );
                return Ok(ContainerOutput::failure(format!(
                    "Container spawn error: {}",
                    e
                )));
            }
        };

        on_spawned(&SpawnedSandbox {
            container_name: &container_name,
            pid: child.id(),
        });

        let stdin_task = child.stdin.take().map(|stdin| write_input(stdin, payload));

        let streaming = sink.is_some();
        let delivery = sink.map(OutputDelivery::spawn);
        let configured_timeout = group.timeout_override().unwrap_or(self.config.timeout);
        let opts = SuperviseOptions {
            runtime_binary: self.config.runtime_binary.clone(),
            container_name: container_name.clone(),
            log_label: group.folder.clone(),
            timeout: self.config.effective_timeout(group.timeout_override()),
            stop_timeout: self.config.stop_timeout,
            max_output_bytes: self.config.max_output_bytes,
        };

        let run = supervise(child, &opts, delivery.as_ref()).await;
        if let Some(task) = stdin_task {
            task.abort();
        }
        if let Some(delivery) = delivery {
            let delivered = delivery.finish().await;
            tracing::debug!(group = %group.name, delivered, "Streamed output drained");
        }

        write_run_log(
            &self.planner.paths().logs_dir(&group.folder),
            &RunLogEntry {
                group_name: &group.name,
                container_name: &container_name,
                input: &input,
                container_args: &args,
                mounts: &mounts,
                run: &run,
                verbose: self.config.verbose_run_logs,
            },
        );

        self.record_auth_outcome(auth_method, &run);
        Ok(classify(&run, streaming, configured_timeout, &group.name))
    }

    fn record_auth_outcome(&self, method: AuthMethod, run: &SupervisedRun) {
        let clean_exit = matches!(run.termination, Termination::Exited { code: Some(0) });
        if let Some(signal) = &run.rate_limit {
            tracing::warn!(
                auth = %method,
                stream = %signal.stream,
                matched = %signal.matched,
                "Run hit a rate limit"
            );
        }
        self.credentials
            .record_run_outcome(method, run.rate_limit.is_some(), clean_exit);
    }

    /// Start a throwaway container so the image is pulled and cached before
    /// the first real run. The outcome is only logged.
    pub fn prewarm(&self) -> JoinHandle<()> {
        let runtime = self.config.runtime_binary.clone();
        let image = self.config.image.clone();
        tokio::spawn(async move {
            tracing::info!(image = %image, "Pre-warming container image");
            let status = Command::new(&runtime)
                .args(["run", "--rm", "--entrypoint", "true", image.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(s) if s.success() => tracing::info!("Container image pre-warmed"),
                Ok(s) => tracing::warn!(code = ?s.code(), "Container pre-warm exited with non-zero code"),
                Err(e) => tracing::warn!("Container pre-warm failed: {}", e),
            }
        })
    }
}

fn write_input(mut stdin: tokio::process::ChildStdin, payload: Vec<u8>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&payload).await {
            tracing::warn!("Failed to write sandbox input: {}", e);
            return;
        }
        if let Err(e) = stdin.shutdown().await {
            tracing::debug!("Failed to close sandbox stdin: {}", e);
        }
    })
}

#[cfg(unix)]
fn host_user() -> Option<(u32, u32)> {
    Some((
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    ))
}

#[cfg(not(unix))]
fn host_user() -> Option<(u32, u32)> {
    None
}

/// `run -i --rm --name <name> [--user uid:gid] -e HOME=.. -e TZ=.. -v .. <image>`
pub fn build_container_args(
    config: &SandboxConfig,
    mounts: &[Mount],
    container_name: &str,
    host_user: Option<(u32, u32)>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-i".into(),
        "--rm".into(),
        "--name".into(),
        container_name.to_string(),
    ];

    if let Some((uid, gid)) = host_user
        && uid != 0
        && uid != CONTAINER_UID
    {
        args.push("--user".into());
        args.push(format!("{}:{}", uid, gid));
    }

    args.push("-e".into());
    args.push(format!("HOME={}", CONTAINER_HOME));
    args.push("-e".into());
    args.push(format!("TZ={}", config.timezone));

    for mount in mounts {
        args.push("-v".into());
        args.push(mount.volume_arg());
    }

    args.push(config.image.clone());
    args
}

fn stderr_tail(stderr: &str) -> &str {
    let count = stderr.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return stderr;
    }
    match stderr.char_indices().nth(count - STDERR_TAIL_CHARS) {
        Some((idx, _)) => &stderr[idx..],
        None => stderr,
    }
}

/// Turn a supervised run into the caller-facing result.
pub fn classify(
    run: &SupervisedRun,
    streaming: bool,
    configured_timeout: Duration,
    group_name: &str,
) -> RunResult {
    let duration_ms = run.duration.as_millis() as u64;
    match &run.termination {
        Termination::TimedOut { code } => {
            if run.had_streaming_output {
                tracing::info!(
                    group = %group_name,
                    duration_ms,
                    code = ?code,
                    "Container timed out after output (idle cleanup)"
                );
                ContainerOutput::success(None, run.new_session_id.clone())
            } else {
                tracing::error!(
                    group = %group_name,
                    duration_ms,
                    code = ?code,
                    "Container timed out with no output"
                );
                ContainerOutput::failure(format!(
                    "Container timed out after {}ms",
                    configured_timeout.as_millis()
                ))
            }
        }
        Termination::WaitFailed(e) => {
            tracing::error!(group = %group_name, "Failed waiting for container: {}", e);
            ContainerOutput::failure(format!("Container wait error: {}", e))
        }
        Termination::Exited { code } if *code != Some(0) => {
            let stderr = run.stderr.to_string_lossy();
            let code_label = code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "null".to_string());
            tracing::error!(
                group = %group_name,
                code = %code_label,
                duration_ms,
                "Container exited with error"
            );
            ContainerOutput::failure(format!(
                "Container exited with code {}: {}",
                code_label,
                stderr_tail(&stderr)
            ))
        }
        Termination::Exited { .. } if streaming => {
            tracing::info!(
                group = %group_name,
                duration_ms,
                new_session_id = ?run.new_session_id,
                "Container completed (streaming mode)"
            );
            ContainerOutput::success(None, run.new_session_id.clone())
        }
        Termination::Exited { .. } => match parse_legacy_output(&run.stdout.to_string_lossy()) {
            Ok(output) => {
                tracing::info!(
                    group = %group_name,
                    duration_ms,
                    status = ?output.status,
                    has_result = output.result.is_some(),
                    "Container completed"
                );
                output
            }
            Err(e) => {
                tracing::error!(group = %group_name, error = %e, "Failed to parse container output");
                ContainerOutput::failure(format!("Failed to parse container output: {}", e))
            }
        },
    }
}
