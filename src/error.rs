//! Error taxonomy for the lifecycle manager.
//!
//! Synthesis and spawn failures surface synchronously from `start`; runtime
//! crashes are absorbed by the supervisor's restart policy and only show up
//! as a `Failed` state once the retry budget is spent.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from config synthesis.
#[derive(Debug, Error)]
pub enum SynthError {
    /// The base template is absent or not a JSON object. Fatal for
    /// synthesis; nothing is written.
    #[error("base config template missing or malformed: {path}")]
    TemplateMissing { path: PathBuf },

    /// Writing the per-subscriber artifact failed. Retryable; no partial
    /// artifact is ever left behind (write-temp-then-rename).
    #[error("failed to persist config artifact {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The worker process could not be started.
#[derive(Debug, Error)]
#[error("failed to spawn worker process: {0}")]
pub struct SpawnError(#[from] pub std::io::Error);

/// Errors from the status/balance gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("balance query timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("worker unreachable: {detail}")]
    Unreachable { detail: String },
}

/// Errors surfaced by supervisor control operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Synthesis(#[from] SynthError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}
