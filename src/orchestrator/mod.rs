//! Sandbox orchestration: mount planning, process supervision and the
//! streaming output protocol.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ ContainerRunner::run(group, input, on_spawned, sink)         │
//! │                                                              │
//! │  MountPlanner ──▶ mounts + provisioning report               │
//! │  CredentialProvisioner ──▶ secrets (OAuth xor fallback key)  │
//! │  spawn `<runtime> run -i --rm ...`, write input to stdin     │
//! │  supervise: parser ─▶ OutputDelivery ─▶ OutputSink          │
//! │             watchdog ─▶ stop / kill                          │
//! │  run log, auth transitions, classify ─▶ RunResult           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod container_runner;
pub mod delivery;
pub mod mount_security;
pub mod mounts;
pub mod protocol;
pub mod rate_limit;
pub mod run_log;
pub mod supervisor;

pub use container_runner::{ContainerRunner, SpawnedSandbox, build_container_args, classify};
pub use delivery::{DELIVERY_QUEUE_DEPTH, OutputDelivery, OutputSink};
pub use mount_security::{AllowedRoot, AllowlistMountValidator, MountAllowlist, MountValidator};
pub use mounts::{
    Mount, MountPlan, MountPlanner, ProvisioningPlan, ProvisioningReport, ProvisioningStep,
    validate_group_folder,
};
pub use protocol::{
    ContainerInput, ContainerOutput, OUTPUT_END_MARKER, OUTPUT_START_MARKER, OutputParser,
    OutputStatus, ParsedUnit, RunResult, parse_legacy_output,
};
pub use rate_limit::{RateLimitDetector, RateLimitSignal};
pub use run_log::{RunLogEntry, render_run_log, write_run_log};
pub use supervisor::{
    CappedBuffer, StreamKind, SuperviseOptions, SupervisedRun, Termination, supervise,
};
