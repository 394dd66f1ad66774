//! End-to-end runs against a fake container runtime.
//!
//! The runtime is a shell script that records its stdin and arguments and
//! then plays a scripted scenario. `<runtime> stop` always fails so the
//! watchdog has to fall through to a force kill.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use groupclaw::Config;
use groupclaw::groups::Group;
use groupclaw::orchestrator::{
    ContainerInput, ContainerOutput, ContainerRunner, OUTPUT_END_MARKER, OUTPUT_START_MARKER,
    OutputSink, OutputStatus,
};

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    config: Config,
}

impl Harness {
    fn new(scenario: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let script = root.join("fake-runtime.sh");
        let body = format!(
            "#!/bin/sh\n\
             if [ \"$1\" = \"stop\" ]; then\n  exit 1\nfi\n\
             printf '%s\\n' \"$@\" > '{args}'\n\
             cat > '{stdin}'\n\
             {scenario}\n",
            args = root.join("args.txt").display(),
            stdin = root.join("stdin.json").display(),
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::rooted_at(&root, root.join("home"));
        config.sandbox.runtime_binary = script.display().to_string();
        config.sandbox.timeout = Duration::from_secs(10);
        config.sandbox.idle_timeout = Duration::ZERO;
        config.sandbox.idle_grace = Duration::ZERO;
        config.sandbox.stop_timeout = Duration::from_secs(1);

        Self {
            _dir: dir,
            root,
            config,
        }
    }

    fn with_env(self, contents: &str) -> Self {
        std::fs::write(self.root.join(".env"), contents).unwrap();
        self
    }

    fn with_oauth_token(self) -> Self {
        let creds = &self.config.paths.host_credentials_file;
        std::fs::create_dir_all(creds.parent().unwrap()).unwrap();
        let json = serde_json::json!({
            "claudeAiOauth": {
                "accessToken": "oauth-live",
                "refreshToken": "rt",
                "expiresAt": Utc::now().timestamp_millis() + 3_600_000
            }
        });
        std::fs::write(creds, json.to_string()).unwrap();
        self
    }

    fn runner(&self) -> ContainerRunner {
        ContainerRunner::from_config(&self.config).unwrap()
    }

    fn recorded_stdin(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.root.join("stdin.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    fn recorded_args(&self) -> Vec<String> {
        std::fs::read_to_string(self.root.join("args.txt"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn run_logs(&self, folder: &str) -> Vec<String> {
        let dir = self.config.paths.logs_dir(folder);
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .map(|e| std::fs::read_to_string(e.unwrap().path()).unwrap())
            .collect()
    }
}

fn emit(json: &str) -> String {
    format!(
        "printf '%s\\n' '{}' '{}' '{}'",
        OUTPUT_START_MARKER, json, OUTPUT_END_MARKER
    )
}

fn group() -> Group {
    Group::new("Team Chat", "team-chat")
}

fn input(is_main: bool) -> ContainerInput {
    ContainerInput::new("hello", "team-chat", "chat@example", is_main)
}

fn collecting_sink() -> (Arc<dyn OutputSink>, Arc<Mutex<Vec<ContainerOutput>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink: Arc<dyn OutputSink> = Arc::new(move |output: ContainerOutput| {
        let seen = Arc::clone(&sink_seen);
        async move {
            seen.lock().await.push(output);
        }
    });
    (sink, seen)
}

fn fallback_since(h: &Harness) -> Option<i64> {
    let path = &h.config.auth.fallback_state_file;
    let raw = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    value["fallbackSince"].as_i64()
}

#[tokio::test]
async fn test_streamed_units_delivered_in_order() {
    let scenario = [
        emit(r#"{"status":"success","result":"first","newSessionId":"s-1"}"#),
        "echo 'noise between units'".to_string(),
        emit(r#"{"status":"success","result":"second","newSessionId":"s-2"}"#),
    ]
    .join("\n");
    let h = Harness::new(&scenario);
    let (sink, seen) = collecting_sink();

    let mut spawned_name = None;
    let result = h
        .runner()
        .run(
            &group(),
            input(false),
            |s| spawned_name = Some(s.container_name.to_string()),
            Some(sink),
        )
        .await
        .unwrap();

    assert_eq!(result.status, OutputStatus::Success);
    assert_eq!(result.result, None);
    assert_eq!(result.new_session_id.as_deref(), Some("s-2"));

    let seen = seen.lock().await;
    let results: Vec<_> = seen.iter().map(|o| o.result.as_deref()).collect();
    assert_eq!(results, vec![Some("first"), Some("second")]);

    let name = spawned_name.unwrap();
    assert!(name.starts_with("groupclaw-team-chat-"));
    let args = h.recorded_args();
    assert_eq!(&args[..5], &["run", "-i", "--rm", "--name", name.as_str()]);
    assert!(args.iter().any(|a| a.ends_with(":/workspace/group")));
    assert!(!args.iter().any(|a| a.ends_with(":/workspace/project")));
    assert_eq!(h.run_logs("team-chat").len(), 1);
}

#[tokio::test]
async fn test_legacy_mode_parses_final_output() {
    let scenario = [
        emit(r#"{"status":"success","result":"draft"}"#),
        emit(r#"{"status":"success","result":"final answer","newSessionId":"s-9"}"#),
    ]
    .join("\n");
    let h = Harness::new(&scenario);

    let result = h
        .runner()
        .run(&group(), input(true), |_| {}, None)
        .await
        .unwrap();

    assert_eq!(result.status, OutputStatus::Success);
    assert_eq!(result.result.as_deref(), Some("final answer"));
    assert_eq!(result.new_session_id.as_deref(), Some("s-9"));
    assert!(
        h.recorded_args()
            .iter()
            .any(|a| a.ends_with(":/workspace/project"))
    );
}

#[tokio::test]
async fn test_legacy_mode_unparseable_output() {
    let h = Harness::new("echo 'no json here'");

    let result = h
        .runner()
        .run(&group(), input(false), |_| {}, None)
        .await
        .unwrap();

    assert_eq!(result.status, OutputStatus::Error);
    assert!(
        result
            .error
            .unwrap()
            .starts_with("Failed to parse container output:")
    );
}

#[tokio::test]
async fn test_non_zero_exit_reports_code_and_stderr() {
    let h = Harness::new("echo 'agent crashed: bad state' >&2\nexit 3");

    let result = h
        .runner()
        .run(&group(), input(false), |_| {}, None)
        .await
        .unwrap();

    let error = result.error.unwrap();
    assert!(error.starts_with("Container exited with code 3: "), "{error}");
    assert!(error.contains("agent crashed: bad state"));
}

#[tokio::test]
async fn test_timeout_without_output_is_an_error() {
    let mut h = Harness::new("exec sleep 30");
    h.config.sandbox.timeout = Duration::from_millis(300);

    let started = std::time::Instant::now();
    let result = h
        .runner()
        .run(&group(), input(false), |_| {}, None)
        .await
        .unwrap();

    assert_eq!(result.status, OutputStatus::Error);
    assert_eq!(result.error.as_deref(), Some("Container timed out after 300ms"));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(h.run_logs("team-chat")[0].contains("TIMEOUT"));
}

#[tokio::test]
async fn test_timeout_after_streamed_output_is_idle_cleanup() {
    let scenario = format!(
        "{}\nexec sleep 30",
        emit(r#"{"status":"success","result":"done","newSessionId":"s-3"}"#)
    );
    let mut h = Harness::new(&scenario);
    h.config.sandbox.timeout = Duration::from_millis(300);
    let (sink, seen) = collecting_sink();

    let result = h
        .runner()
        .run(&group(), input(false), |_| {}, Some(sink))
        .await
        .unwrap();

    assert_eq!(result.status, OutputStatus::Success);
    assert_eq!(result.result, None);
    assert_eq!(result.new_session_id.as_deref(), Some("s-3"));
    assert_eq!(seen.lock().await.len(), 1);
}

#[tokio::test]
async fn test_spawn_failure() {
    let mut h = Harness::new("exit 0");
    h.config.sandbox.runtime_binary = h.root.join("missing-runtime").display().to_string();

    let mut spawned = false;
    let result = h
        .runner()
        .run(&group(), input(false), |_| spawned = true, None)
        .await
        .unwrap();

    assert!(!spawned);
    assert!(
        result
            .error
            .unwrap()
            .starts_with("Container spawn error:")
    );
}

#[tokio::test]
async fn test_secrets_reach_stdin_but_not_the_run_log() {
    let mut h = Harness::new(&emit(r#"{"status":"success","result":"ok"}"#))
        .with_env("ANTHROPIC_API_KEY_FALLBACK=sk-fallback-123\n");
    h.config.sandbox.verbose_run_logs = true;

    let result = h
        .runner()
        .run(&group(), input(false), |_| {}, None)
        .await
        .unwrap();
    assert!(result.is_success());

    let stdin = h.recorded_stdin();
    assert_eq!(stdin["prompt"], "hello");
    assert_eq!(stdin["groupFolder"], "team-chat");
    assert_eq!(stdin["secrets"]["ANTHROPIC_API_KEY"], "sk-fallback-123");
    assert!(stdin["secrets"].get("ANTHROPIC_API_KEY_FALLBACK").is_none());
    assert!(stdin["secrets"].get("CLAUDE_CODE_OAUTH_TOKEN").is_none());

    let logs = h.run_logs("team-chat");
    assert_eq!(logs.len(), 1);
    assert!(logs[0].contains("\"prompt\": \"hello\""));
    assert!(!logs[0].contains("sk-fallback-123"));

    // No OAuth credential, so the run itself opened the fallback window.
    assert!(fallback_since(&h).is_some());
}

#[tokio::test]
async fn test_rate_limited_oauth_run_enters_fallback() {
    let h = Harness::new("echo 'API Error: 429 Too Many Requests' >&2\nexit 1")
        .with_env("ANTHROPIC_API_KEY_FALLBACK=sk-fb\n")
        .with_oauth_token();

    let result = h
        .runner()
        .run(&group(), input(false), |_| {}, None)
        .await
        .unwrap();

    assert_eq!(result.status, OutputStatus::Error);
    assert_eq!(h.recorded_stdin()["secrets"]["CLAUDE_CODE_OAUTH_TOKEN"], "oauth-live");
    assert!(fallback_since(&h).is_some());

    // The next run goes straight to the fallback key.
    let resolved = h.runner().credentials().resolve().await;
    assert_eq!(resolved.secrets.expose("ANTHROPIC_API_KEY"), Some("sk-fb"));
    assert!(!resolved.secrets.contains_key("CLAUDE_CODE_OAUTH_TOKEN"));
}

#[tokio::test]
async fn test_clean_oauth_run_clears_fallback_record() {
    let h = Harness::new(&emit(r#"{"status":"success","result":"ok"}"#)).with_oauth_token();
    let runner = h.runner();
    // Active window but no fallback key configured: OAuth is tried anyway.
    runner.credentials().fallback_store().enter_fallback(Utc::now());

    let result = runner
        .run(&group(), input(false), |_| {}, None)
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(fallback_since(&h), None);
}
