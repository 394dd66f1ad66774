//! groupclaw: per-group agent sandboxes.
//!
//! Each registered group gets its own container with a private filesystem
//! view, one resolved model credential and a streaming stdout protocol.
//! The [`orchestrator::ContainerRunner`] drives a single run end to end.

pub mod auth;
pub mod config;
pub mod error;
pub mod groups;
pub mod orchestrator;

pub use config::Config;
pub use error::{ConfigError, CredentialError, ProvisionError, SandboxError};
pub use groups::Group;
pub use orchestrator::{ContainerInput, ContainerOutput, ContainerRunner, RunResult};
