//! Sandbox process supervision: stream reading, the activity watchdog and
//! graceful/forced termination.
//!
//! The loop below owns a spawned child and multiplexes four event sources:
//!
//! ```text
//!   stdout chunk ──▶ capped log buffer, rate-limit scan, marker parser
//!                      └─ each parsed unit: reset watchdog, enqueue delivery
//!   stderr chunk ──▶ capped log buffer, rate-limit scan, debug log
//!                      (never resets the watchdog)
//!   watchdog     ──▶ `<runtime> stop <name>` (bounded), then force kill
//!   exit         ──▶ drain remaining pipe data (bounded), return
//! ```

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use super::delivery::OutputDelivery;
use super::protocol::{OutputParser, ParsedUnit};
use super::rate_limit::{RateLimitDetector, RateLimitSignal};

/// Upper bound on reading leftover pipe data after the process exited.
pub const POST_EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Byte buffer that keeps at most `cap` bytes and remembers if it dropped any.
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.data.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Knobs for one supervised run.
#[derive(Debug, Clone)]
pub struct SuperviseOptions {
    pub runtime_binary: String,
    pub container_name: String,
    /// Label for log lines (the group folder).
    pub log_label: String,
    pub timeout: Duration,
    pub stop_timeout: Duration,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own (or after being stopped). `None` when
    /// killed by a signal.
    Exited { code: Option<i32> },
    /// The watchdog fired; the process was stopped or killed afterwards.
    TimedOut { code: Option<i32> },
    /// Waiting on the process failed.
    WaitFailed(String),
}

/// Everything the supervisor observed about one run.
#[derive(Debug)]
pub struct SupervisedRun {
    pub termination: Termination,
    pub stdout: CappedBuffer,
    pub stderr: CappedBuffer,
    /// Units parsed successfully (drives the watchdog).
    pub parsed_units: usize,
    /// Whether any unit was handed to the delivery queue.
    pub had_streaming_output: bool,
    /// Last session id seen in a parsed unit.
    pub new_session_id: Option<String>,
    pub rate_limit: Option<RateLimitSignal>,
    pub duration: Duration,
}

struct RunState<'a> {
    label: &'a str,
    delivery: Option<&'a OutputDelivery>,
    parser: OutputParser,
    stdout: CappedBuffer,
    stderr: CappedBuffer,
    rate_limit: RateLimitDetector,
    parsed_units: usize,
    had_streaming_output: bool,
    new_session_id: Option<String>,
}

impl RunState<'_> {
    /// Returns whether the chunk completed at least one valid unit.
    async fn on_stdout(&mut self, chunk: &[u8]) -> bool {
        self.stdout.push(chunk);
        if self
            .rate_limit
            .observe(StreamKind::Stdout, &String::from_utf8_lossy(chunk))
        {
            tracing::warn!(group = %self.label, "Rate limit detected in container stdout");
        }

        let mut activity = false;
        for unit in self.parser.push(chunk) {
            match unit {
                ParsedUnit::Output(output) => {
                    activity = true;
                    self.parsed_units += 1;
                    if let Some(id) = &output.new_session_id {
                        self.new_session_id = Some(id.clone());
                    }
                    if let Some(delivery) = self.delivery {
                        self.had_streaming_output = true;
                        delivery.enqueue(output).await;
                    }
                }
                ParsedUnit::Malformed { raw, error } => {
                    tracing::warn!(
                        group = %self.label,
                        error = %error,
                        "Failed to parse streamed output unit: {}",
                        crate::auth::preview_body(&raw)
                    );
                }
            }
        }
        activity
    }

    fn on_stderr(&mut self, chunk: &[u8]) {
        self.stderr.push(chunk);
        let text = String::from_utf8_lossy(chunk);
        if self.rate_limit.observe(StreamKind::Stderr, &text) {
            tracing::warn!(group = %self.label, "Rate limit detected in container stderr");
        }
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(container = %self.label, "{}", line);
        }
    }
}

type StopFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Supervise a spawned sandbox until it exits.
///
/// `delivery` is `Some` in streaming mode. The child's stdout and stderr
/// must be piped; stdin should already be written and closed.
pub async fn supervise(
    mut child: Child,
    opts: &SuperviseOptions,
    delivery: Option<&OutputDelivery>,
) -> SupervisedRun {
    let started = Instant::now();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; READ_CHUNK_SIZE];
    let mut err_buf = vec![0u8; READ_CHUNK_SIZE];

    let mut state = RunState {
        label: &opts.log_label,
        delivery,
        parser: OutputParser::new(),
        stdout: CappedBuffer::new(opts.max_output_bytes),
        stderr: CappedBuffer::new(opts.max_output_bytes),
        rate_limit: RateLimitDetector::new(),
        parsed_units: 0,
        had_streaming_output: false,
        new_session_id: None,
    };

    let watchdog = tokio::time::sleep(opts.timeout);
    tokio::pin!(watchdog);
    let mut timed_out = false;
    let mut stop: Option<StopFuture> = None;

    let wait_result = loop {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                Ok(0) | Err(_) => stdout = None,
                Ok(n) => {
                    if state.on_stdout(&out_buf[..n]).await && !timed_out {
                        watchdog
                            .as_mut()
                            .reset(tokio::time::Instant::now() + opts.timeout);
                    }
                }
            },
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                Ok(0) | Err(_) => stderr = None,
                Ok(n) => state.on_stderr(&err_buf[..n]),
            },
            status = child.wait() => break status,
            _ = &mut watchdog, if !timed_out => {
                timed_out = true;
                tracing::error!(
                    group = %opts.log_label,
                    container_name = %opts.container_name,
                    timeout_ms = opts.timeout.as_millis() as u64,
                    "Container timeout, stopping gracefully"
                );
                stop = Some(graceful_stop(
                    opts.runtime_binary.clone(),
                    opts.container_name.clone(),
                    opts.stop_timeout,
                ));
            },
            stopped = await_stop(&mut stop), if stop.is_some() => {
                if stopped {
                    // Give the runtime the same bound to actually exit.
                    let bound = opts.stop_timeout;
                    stop = Some(Box::pin(async move {
                        tokio::time::sleep(bound).await;
                        false
                    }));
                } else {
                    stop = None;
                    tracing::warn!(
                        container_name = %opts.container_name,
                        "Graceful stop failed, force killing"
                    );
                    if let Err(e) = child.start_kill() {
                        tracing::error!(
                            container_name = %opts.container_name,
                            "Failed to kill container process: {}", e
                        );
                    }
                }
            },
        }
    };

    // Pick up output written just before exit.
    let drain = async {
        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => {
                        state.on_stdout(&out_buf[..n]).await;
                    }
                },
                read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => state.on_stderr(&err_buf[..n]),
                },
            }
        }
    };
    if tokio::time::timeout(POST_EXIT_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::debug!(
            container_name = %opts.container_name,
            "Output pipes still open after exit, giving up on remaining data"
        );
    }

    let termination = match wait_result {
        Ok(status) if timed_out => Termination::TimedOut {
            code: status.code(),
        },
        Ok(status) => Termination::Exited {
            code: status.code(),
        },
        Err(e) => Termination::WaitFailed(e.to_string()),
    };

    SupervisedRun {
        termination,
        stdout: state.stdout,
        stderr: state.stderr,
        parsed_units: state.parsed_units,
        had_streaming_output: state.had_streaming_output,
        new_session_id: state.new_session_id,
        rate_limit: state.rate_limit.signal().cloned(),
        duration: started.elapsed(),
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn await_stop(stop: &mut Option<StopFuture>) -> bool {
    match stop {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// `<runtime> stop <name>`, bounded. Resolves to whether the runtime
/// reported success in time.
fn graceful_stop(runtime: String, container_name: String, bound: Duration) -> StopFuture {
    Box::pin(async move {
        let mut cmd = Command::new(&runtime);
        cmd.arg("stop")
            .arg(&container_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(bound, cmd.status()).await {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                tracing::warn!(
                    container_name = %container_name,
                    "{} stop exited with {}",
                    runtime,
                    status
                );
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(container_name = %container_name, "{} stop failed: {}", runtime, e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    container_name = %container_name,
                    timeout_ms = bound.as_millis() as u64,
                    "{} stop timed out",
                    runtime
                );
                false
            }
        }
    })
}
