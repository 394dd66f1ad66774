use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Read an env var, treating unset and blank values the same.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{}': {}", raw, e),
            }),
        None => Ok(default),
    }
}

pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{}' is not a boolean (use true/false)", raw),
        }),
        None => Ok(default),
    }
}

pub(crate) fn parse_string_env(
    key: &str,
    default: impl Into<String>,
) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.into()))
}

/// Parse a millisecond count into a `Duration`.
pub(crate) fn parse_duration_ms_env(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let ms = parse_optional_env(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

/// Split a comma-separated list, dropping blanks.
pub(crate) fn parse_list_env(key: &str, default: &[&str]) -> Result<Vec<String>, ConfigError> {
    Ok(optional_env(key)?
        .map(|s| {
            s.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect()))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
