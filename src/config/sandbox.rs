use std::time::Duration;

use crate::config::helpers::{
    optional_env, parse_bool_env, parse_duration_ms_env, parse_optional_env, parse_string_env,
};
use crate::error::ConfigError;

/// Container runtime and watchdog configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container runtime CLI (`docker`, `podman`, ...).
    pub runtime_binary: String,
    /// Image the agent runs in.
    pub image: String,
    /// Hard timeout for a run, unless a group overrides it.
    pub timeout: Duration,
    /// Inactivity window after which a finished sandbox is reaped.
    pub idle_timeout: Duration,
    /// Extra time added on top of `idle_timeout` when computing the hard limit.
    pub idle_grace: Duration,
    /// Upper bound on how long `<runtime> stop` may take before a force kill.
    pub stop_timeout: Duration,
    /// Per-stream cap on retained stdout/stderr bytes.
    pub max_output_bytes: usize,
    /// Mount the live agent-runner sources instead of the baked-in build.
    pub dev_mount: bool,
    /// Timezone passed to the container as `TZ`.
    pub timezone: String,
    /// Dump full input/output into every run log, not only failed runs.
    pub verbose_run_logs: bool,
    /// Prefix for generated container names.
    pub name_prefix: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_binary: "docker".to_string(),
            image: "groupclaw-agent:latest".to_string(),
            timeout: Duration::from_millis(1_800_000),
            idle_timeout: Duration::from_millis(1_800_000),
            idle_grace: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(15),
            max_output_bytes: 10 * 1024 * 1024,
            dev_mount: false,
            timezone: "UTC".to_string(),
            verbose_run_logs: false,
            name_prefix: "groupclaw".to_string(),
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let verbose_run_logs = optional_env("LOG_LEVEL")?
            .map(|level| {
                matches!(
                    level.trim().to_ascii_lowercase().as_str(),
                    "debug" | "trace"
                )
            })
            .unwrap_or(defaults.verbose_run_logs);

        Ok(Self {
            runtime_binary: parse_string_env("CONTAINER_RUNTIME", defaults.runtime_binary)?,
            image: parse_string_env("CONTAINER_IMAGE", defaults.image)?,
            timeout: parse_duration_ms_env("CONTAINER_TIMEOUT", defaults.timeout)?,
            idle_timeout: parse_duration_ms_env("IDLE_TIMEOUT", defaults.idle_timeout)?,
            idle_grace: parse_duration_ms_env("IDLE_GRACE_MS", defaults.idle_grace)?,
            stop_timeout: defaults.stop_timeout,
            max_output_bytes: parse_optional_env(
                "CONTAINER_MAX_OUTPUT_SIZE",
                defaults.max_output_bytes,
            )?,
            dev_mount: parse_bool_env("DEV_MOUNT", defaults.dev_mount)?,
            timezone: parse_string_env("TZ", defaults.timezone)?,
            verbose_run_logs,
            name_prefix: parse_string_env("CONTAINER_NAME_PREFIX", defaults.name_prefix)?,
        })
    }

    /// Hard limit for one run.
    ///
    /// Always leaves room for the idle window plus grace, so a sandbox that
    /// answered and then went quiet is reaped by the idle path first.
    pub fn effective_timeout(&self, group_override: Option<Duration>) -> Duration {
        let configured = group_override.unwrap_or(self.timeout);
        configured.max(self.idle_timeout.saturating_add(self.idle_grace))
    }
}
