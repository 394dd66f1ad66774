//! Wire types and framing for the sandbox stdin/stdout protocol.
//!
//! The sandbox reads one JSON [`ContainerInput`] from stdin. It answers with
//! zero or more JSON [`ContainerOutput`] units on stdout, each wrapped in
//! the start/end marker pair:
//!
//! ```text
//! ---GROUPCLAW_OUTPUT_START---
//! {"status":"success","result":"hello","newSessionId":"s-1"}
//! ---GROUPCLAW_OUTPUT_END---
//! ```
//!
//! Anything outside a marker pair is diagnostic noise.

use serde::{Deserialize, Serialize};

use crate::auth::SecretMap;

pub const OUTPUT_START_MARKER: &str = "---GROUPCLAW_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---GROUPCLAW_OUTPUT_END---";

/// Payload written once to the sandbox's stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<SecretMap>,
}

impl ContainerInput {
    pub fn new(
        prompt: impl Into<String>,
        group_folder: impl Into<String>,
        chat_jid: impl Into<String>,
        is_main: bool,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: None,
            group_folder: group_folder.into(),
            chat_jid: chat_jid.into(),
            is_main,
            is_scheduled_task: None,
            secrets: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn scheduled(mut self) -> Self {
        self.is_scheduled_task = Some(true);
        self
    }

    /// Serialize with `secrets` attached, then strip them again.
    ///
    /// The secrets are gone from `self` when this returns, whether or not
    /// serialization succeeded, so the input can be logged afterwards.
    pub fn encode_with_secrets(&mut self, secrets: SecretMap) -> Result<Vec<u8>, serde_json::Error> {
        self.secrets = Some(secrets);
        let encoded = serde_json::to_vec(self);
        self.secrets = None;
        encoded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Success,
    Error,
}

/// One output unit from the sandbox; also the shape of a run's final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    pub status: OutputStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
}

/// Final outcome of a run. Same shape as a streamed unit.
pub type RunResult = ContainerOutput;

impl ContainerOutput {
    pub fn success(result: Option<String>, new_session_id: Option<String>) -> Self {
        Self {
            status: OutputStatus::Success,
            result,
            new_session_id,
            error: None,
            progress: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(error.into()),
            progress: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutputStatus::Success
    }
}

/// Decode outcome for the text between one marker pair.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedUnit {
    Output(ContainerOutput),
    Malformed { raw: String, error: String },
}

fn decode_unit(raw: &str) -> ParsedUnit {
    let raw = raw.trim();
    match serde_json::from_str::<ContainerOutput>(raw) {
        Ok(output) => ParsedUnit::Output(output),
        Err(e) => ParsedUnit::Malformed {
            raw: raw.to_string(),
            error: e.to_string(),
        },
    }
}

/// Incremental marker scanner over a byte stream.
///
/// Works on raw bytes so a UTF-8 sequence split across reads is decoded
/// only once the whole unit is buffered.
#[derive(Debug, Default)]
pub struct OutputParser {
    buf: Vec<u8>,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every unit completed by it, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ParsedUnit> {
        self.buf.extend_from_slice(chunk);
        let start_marker = OUTPUT_START_MARKER.as_bytes();
        let end_marker = OUTPUT_END_MARKER.as_bytes();
        let mut units = Vec::new();

        loop {
            let Some(start) = find(&self.buf, start_marker) else {
                // Keep only a tail that might grow into a start marker.
                let keep = partial_suffix_len(&self.buf, start_marker);
                let drop_to = self.buf.len() - keep;
                self.buf.drain(..drop_to);
                break;
            };

            let body_start = start + start_marker.len();
            let Some(end_offset) = find(&self.buf[body_start..], end_marker) else {
                self.buf.drain(..start);
                break;
            };

            let body_end = body_start + end_offset;
            let raw = String::from_utf8_lossy(&self.buf[body_start..body_end]).into_owned();
            self.buf.drain(..body_end + end_marker.len());
            units.push(decode_unit(&raw));
        }

        units
    }

    /// Bytes held back waiting for more input.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

/// Extract the final result from a finished sandbox's full stdout.
///
/// Uses the last complete marker pair, or the last non-empty line when the
/// sandbox printed no markers at all.
pub fn parse_legacy_output(stdout: &str) -> Result<ContainerOutput, String> {
    let framed = stdout.rfind(OUTPUT_END_MARKER).and_then(|end| {
        stdout[..end]
            .rfind(OUTPUT_START_MARKER)
            .map(|start| &stdout[start + OUTPUT_START_MARKER.len()..end])
    });

    let json = match framed {
        Some(body) => body.trim(),
        None => stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or(""),
    };

    match decode_unit(json) {
        ParsedUnit::Output(output) => Ok(output),
        ParsedUnit::Malformed { error, .. } => Err(error),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest proper prefix of `needle` that `haystack` ends with.
fn partial_suffix_len(haystack: &[u8], needle: &[u8]) -> usize {
    let max = needle.len().saturating_sub(1).min(haystack.len());
    (1..=max)
        .rev()
        .find(|&k| haystack.ends_with(&needle[..k]))
        .unwrap_or(0)
}
