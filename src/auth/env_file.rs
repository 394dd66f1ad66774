//! Reading and updating the `.env` secret store.
//!
//! Secrets for the sandbox come from the env file rather than the process
//! environment, so keys such as the fallback API key never leak into the
//! orchestrator's own env (or any child it spawns).

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;

/// Read the requested keys from an env file. Missing file or missing keys
/// simply yield fewer entries; blank values are skipped.
pub fn read_env_file(path: &Path, keys: &[&str]) -> HashMap<String, String> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) => {
            tracing::debug!("Env file {} not readable: {}", path.display(), e);
            return HashMap::new();
        }
    };

    let mut found = HashMap::new();
    for item in iter {
        match item {
            Ok((key, value)) => {
                if keys.contains(&key.as_str()) && !value.trim().is_empty() {
                    found.insert(key, value);
                }
            }
            Err(e) => {
                tracing::warn!("Skipping malformed line in {}: {}", path.display(), e);
            }
        }
    }
    found
}

/// Replace `KEY=...` in the env file with the new value, appending the line
/// if the key is not present yet.
pub fn update_env_value(path: &Path, key: &str, value: &str) -> std::io::Result<()> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let pattern = Regex::new(&format!(r"(?m)^{}=.*$", regex::escape(key)))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let line = format!("{key}={value}");

    let updated = if pattern.is_match(&content) {
        pattern
            .replace(&content, regex::NoExpand(&line))
            .into_owned()
    } else {
        let mut appended = content;
        if !appended.is_empty() && !appended.ends_with('\n') {
            appended.push('\n');
        }
        appended.push_str(&line);
        appended.push('\n');
        appended
    };

    super::write_atomic(path, updated.as_bytes())
}
