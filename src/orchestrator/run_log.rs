//! Per-run diagnostic log files under `groups/<folder>/logs/`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::mounts::Mount;
use super::protocol::ContainerInput;
use super::supervisor::{SupervisedRun, Termination};

/// What a run log is written from.
pub struct RunLogEntry<'a> {
    pub group_name: &'a str,
    pub container_name: &'a str,
    /// Input with secrets already stripped.
    pub input: &'a ContainerInput,
    pub container_args: &'a [String],
    pub mounts: &'a [Mount],
    pub run: &'a SupervisedRun,
    /// Dump input and output even for successful runs.
    pub verbose: bool,
}

fn exit_code_label(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// Render the log body.
///
/// Timed-out runs get a short header-only log. Otherwise failed runs (and
/// every run when `verbose`) include input, args, mounts and both streams;
/// successful runs get a summary.
pub fn render_run_log(entry: &RunLogEntry<'_>, now: DateTime<Utc>) -> String {
    let run = entry.run;
    let duration_ms = run.duration.as_millis();
    let mut out = String::new();

    let (exit_label, is_error) = match &run.termination {
        Termination::TimedOut { code } => {
            let _ = writeln!(out, "=== Container Run Log (TIMEOUT) ===");
            let _ = writeln!(out, "Timestamp: {}", now.to_rfc3339());
            let _ = writeln!(out, "Group: {}", entry.group_name);
            let _ = writeln!(out, "Container: {}", entry.container_name);
            let _ = writeln!(out, "Duration: {}ms", duration_ms);
            let _ = writeln!(out, "Exit Code: {}", exit_code_label(*code));
            let _ = writeln!(out, "Had Streaming Output: {}", run.had_streaming_output);
            return out;
        }
        Termination::Exited { code } => (exit_code_label(*code), *code != Some(0)),
        Termination::WaitFailed(e) => (format!("unknown ({})", e), true),
    };

    let _ = writeln!(out, "=== Container Run Log ===");
    let _ = writeln!(out, "Timestamp: {}", now.to_rfc3339());
    let _ = writeln!(out, "Group: {}", entry.group_name);
    let _ = writeln!(out, "Container: {}", entry.container_name);
    let _ = writeln!(out, "IsMain: {}", entry.input.is_main);
    let _ = writeln!(out, "Duration: {}ms", duration_ms);
    let _ = writeln!(out, "Exit Code: {}", exit_label);
    let _ = writeln!(out, "Stdout Truncated: {}", run.stdout.is_truncated());
    let _ = writeln!(out, "Stderr Truncated: {}", run.stderr.is_truncated());
    out.push('\n');

    if entry.verbose || is_error {
        let input = serde_json::to_string_pretty(entry.input)
            .unwrap_or_else(|e| format!("<unserializable input: {}>", e));
        let _ = writeln!(out, "=== Input ===\n{}\n", input);
        let _ = writeln!(out, "=== Container Args ===\n{}\n", entry.container_args.join(" "));
        let _ = writeln!(out, "=== Mounts ===");
        for mount in entry.mounts {
            let _ = writeln!(out, "{}", mount);
        }
        out.push('\n');
        let _ = writeln!(
            out,
            "=== Stderr{} ===\n{}\n",
            truncated_marker(run.stderr.is_truncated()),
            run.stderr.to_string_lossy()
        );
        let _ = writeln!(
            out,
            "=== Stdout{} ===\n{}",
            truncated_marker(run.stdout.is_truncated()),
            run.stdout.to_string_lossy()
        );
    } else {
        let _ = writeln!(out, "=== Input Summary ===");
        let _ = writeln!(out, "Prompt length: {} chars", entry.input.prompt.chars().count());
        let _ = writeln!(
            out,
            "Session ID: {}",
            entry.input.session_id.as_deref().unwrap_or("new")
        );
        out.push('\n');
        let _ = writeln!(out, "=== Mounts ===");
        for mount in entry.mounts {
            let ro = if mount.readonly { " (ro)" } else { "" };
            let _ = writeln!(out, "{}{}", mount.container_path, ro);
        }
    }
    out
}

fn truncated_marker(truncated: bool) -> &'static str {
    if truncated { " (TRUNCATED)" } else { "" }
}

/// Write the run log. Failures are logged and swallowed.
pub fn write_run_log(logs_dir: &Path, entry: &RunLogEntry<'_>) -> Option<PathBuf> {
    let now = Utc::now();
    let file = logs_dir.join(format!(
        "container-{}.log",
        now.format("%Y-%m-%dT%H-%M-%S-%3fZ")
    ));
    let body = render_run_log(entry, now);

    let result = std::fs::create_dir_all(logs_dir).and_then(|()| std::fs::write(&file, body));
    match result {
        Ok(()) => {
            tracing::debug!(log_file = %file.display(), verbose = entry.verbose, "Container log written");
            Some(file)
        }
        Err(e) => {
            tracing::warn!(log_file = %file.display(), "Failed to write container log: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::orchestrator::supervisor::CappedBuffer;

    fn run(termination: Termination, stdout: &str, stderr: &str) -> SupervisedRun {
        let mut out = CappedBuffer::new(1024);
        out.push(stdout.as_bytes());
        let mut err = CappedBuffer::new(1024);
        err.push(stderr.as_bytes());
        SupervisedRun {
            termination,
            stdout: out,
            stderr: err,
            parsed_units: 0,
            had_streaming_output: false,
            new_session_id: None,
            rate_limit: None,
            duration: Duration::from_millis(1500),
        }
    }

    fn render(run: &SupervisedRun, verbose: bool) -> String {
        let input = ContainerInput::new("hello there", "g1", "jid", false);
        let mounts = vec![
            Mount::new("/host/g1", "/workspace/group", false),
            Mount::new("/host/global", "/workspace/global", true),
        ];
        let args = vec!["run".to_string(), "-i".to_string()];
        let entry = RunLogEntry {
            group_name: "Group One",
            container_name: "groupclaw-g1-1",
            input: &input,
            container_args: &args,
            mounts: &mounts,
            run,
            verbose,
        };
        render_run_log(&entry, Utc::now())
    }

    #[test]
    fn test_timeout_log_is_header_only() {
        let log = render(
            &run(Termination::TimedOut { code: None }, "out", "err"),
            true,
        );
        assert!(log.starts_with("=== Container Run Log (TIMEOUT) ==="));
        assert!(log.contains("Exit Code: signal"));
        assert!(log.contains("Had Streaming Output: false"));
        assert!(!log.contains("=== Stdout"));
    }

    #[test]
    fn test_success_log_is_summary() {
        let log = render(
            &run(Termination::Exited { code: Some(0) }, "secret-ish output", ""),
            false,
        );
        assert!(log.contains("=== Input Summary ==="));
        assert!(log.contains("Prompt length: 11 chars"));
        assert!(log.contains("Session ID: new"));
        assert!(log.contains("/workspace/global (ro)"));
        assert!(!log.contains("/host/g1"));
        assert!(!log.contains("secret-ish output"));
    }

    #[test]
    fn test_error_log_is_verbose() {
        let log = render(
            &run(Termination::Exited { code: Some(2) }, "partial", "boom"),
            false,
        );
        assert!(log.contains("Exit Code: 2"));
        assert!(log.contains("=== Input ==="));
        assert!(log.contains("\"groupFolder\": \"g1\""));
        assert!(log.contains("=== Container Args ===\nrun -i"));
        assert!(log.contains("/host/g1 -> /workspace/group"));
        assert!(log.contains("=== Stderr ===\nboom"));
        assert!(log.contains("=== Stdout ===\npartial"));
    }

    #[test]
    fn test_write_run_log_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("groups").join("g1").join("logs");
        let run = run(Termination::Exited { code: Some(0) }, "", "");
        let input = ContainerInput::new("p", "g1", "jid", true);
        let entry = RunLogEntry {
            group_name: "g",
            container_name: "c",
            input: &input,
            container_args: &[],
            mounts: &[],
            run: &run,
            verbose: false,
        };

        let file = write_run_log(&logs, &entry).unwrap();
        let name = file.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("container-") && name.ends_with(".log"));
        assert!(std::fs::read_to_string(file).unwrap().contains("IsMain: true"));
    }
}
