//! Error types for groupclaw.

use std::path::PathBuf;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Fatal provisioning errors. A run that hits one of these never spawns.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Invalid group folder '{folder}': {reason}")]
    InvalidGroupFolder { folder: String, reason: String },

    #[error("Failed to create directory {}: {source}", path.display())]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the token refresh flows.
///
/// These never abort a run: callers log them and fall back to the last
/// known token.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed to read or write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed credential file {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("Refresh request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Refresh endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),
}

/// Errors that abort a sandbox run before a result can be produced.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Failed to serialize sandbox input: {0}")]
    Serialization(#[from] serde_json::Error),
}
