//! Typed error hierarchy for the pipeline orchestrator.
//!
//! One enum per subsystem, matching the boundary at which errors are raised:
//! - `StateError` — StateStore reads, writes, locking, backups
//! - `SchemaError` — SchemaRegistry canonicalization and validation
//! - `PolicyError` — PolicyLogger and Advisor (never fatal to callers; see `policy` module)
//! - `PhaseError` — PhaseRunner invocation and retry
//! - `OrchestratorError` — top-level control loop, wraps the others via `#[from]`

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("timed out acquiring lock on {path:?} after {timeout_secs}s")]
    LockTimeout { path: PathBuf, timeout_secs: u64 },

    #[error("failed to read state file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write state file at {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state at {path:?} failed validation: {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("backup {path:?} not found")]
    BackupNotFound { path: PathBuf },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid shape at {path}: {reason}")]
    Shape { path: String, reason: String },

    #[error("unsupported schema version {version}")]
    UnsupportedVersion { version: String },

    #[error("strict validation failed: {0}")]
    Strict(String),
}

/// Errors arising in the policy logger / advisor / override store. Never
/// propagated to the orchestrator as a fatal error — callers swallow these
/// (logging a warning) per the §7 propagation policy; the type exists so the
/// swallowing is deliberate and visible at call sites, not accidental.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to write policy log at {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read policy log at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize policy event: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to read overrides file at {path:?}: {source}")]
    OverridesRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write overrides file at {path:?}: {source}")]
    OverridesWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse overrides file at {path:?}: {source}")]
    OverridesParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Categorization of a non-zero phase exit, derived from the stderr tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Oom,
    Timeout,
    Truncation,
    Quality,
    Schema,
    Io,
    Unknown,
}

impl FailureCategory {
    /// Structural failures are not worth retrying: the retry wrapper short-circuits on these.
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureCategory::Schema | FailureCategory::Io)
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCategory::Oom => "oom",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Truncation => "truncation",
            FailureCategory::Quality => "quality",
            FailureCategory::Schema => "schema",
            FailureCategory::Io => "io",
            FailureCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("phase {phase} exceeded its {timeout_secs}s timeout")]
    Timeout { phase: String, timeout_secs: u64 },

    #[error("phase {phase} exited with code {exit_code} ({category})")]
    Failure {
        phase: String,
        exit_code: i32,
        category: FailureCategory,
        stderr_tail: String,
    },

    #[error("failed to spawn phase {phase} executable {command:?}: {source}")]
    Spawn {
        phase: String,
        command: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("phase {phase} exhausted retry budget ({retries} attempts)")]
    RetriesExhausted { phase: String, retries: u32 },

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run was cancelled")]
    Cancelled,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error("input file {path:?} has no file stem")]
    NoFileStem { path: PathBuf },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
