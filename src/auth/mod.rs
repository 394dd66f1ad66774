//! Credential resolution for sandbox runs.
//!
//! Each run receives exactly one primary model credential: the OAuth access
//! token, or (while fallback mode is active) the prepaid API key. Token
//! refreshes and fallback transitions never abort a run; failures are
//! logged and the last known value is used.

mod env_file;
mod fallback;
mod oauth;
mod provisioner;
mod secrets;
mod threads;

pub use env_file::{read_env_file, update_env_value};
pub use fallback::{FALLBACK_DURATION, FallbackState, FallbackStatus, FallbackStore};
pub use oauth::{OAuthRefresher, REFRESH_MARGIN};
pub use provisioner::{AuthMethod, CredentialProvisioner, ResolvedCredentials};
pub use secrets::SecretMap;
pub use threads::{
    THREADS_ASSUMED_VALIDITY, THREADS_REFRESH_MARGIN, ThreadsTokenRefresher, ThreadsTokenState,
};

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// Env-file key holding the prepaid API key.
pub const FALLBACK_KEY_VAR: &str = "ANTHROPIC_API_KEY_FALLBACK";
/// Secret name the sandbox reads the prepaid key from.
pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";
/// Secret name the sandbox reads the OAuth token from.
pub const OAUTH_TOKEN_VAR: &str = "CLAUDE_CODE_OAUTH_TOKEN";
/// Env-file key for the social-platform token.
pub const THREADS_TOKEN_VAR: &str = "THREADS_ACCESS_TOKEN";

/// Write `bytes` to `path` via a uniquely named sibling temp file and a
/// rename, so readers never observe a half-written file and concurrent
/// writers never share a temp file. An existing file's permissions are kept.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    if let Ok(meta) = std::fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions())?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Bound an HTTP error body before it goes into an error or log line.
pub(crate) fn preview_body(body: &str) -> String {
    const MAX_CHARS: usize = 512;
    match body.char_indices().nth(MAX_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("state.json");

        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "state.json")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_atomic_concurrent_writers_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth-state.json");

        let handles: Vec<_> = (0..4)
            .map(|writer| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut failures = 0;
                    for round in 0..200 {
                        let body = format!("{{\"writer\":{},\"round\":{}}}", writer, round);
                        if write_atomic(&path, body.as_bytes()).is_err() {
                            failures += 1;
                        }
                    }
                    failures
                })
            })
            .collect();
        let failures: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(failures, 0);
        let last: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(last["round"], 199);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_keeps_existing_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "A=1\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        write_atomic(&path, b"A=2\n").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "A=2\n");
    }

    #[test]
    fn test_preview_body_is_char_safe() {
        let long = "é".repeat(600);
        let preview = preview_body(&long);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 515);
        assert_eq!(preview_body("short"), "short");
    }
}
