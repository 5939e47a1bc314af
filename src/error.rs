use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::session::SessionState;

/// Recorder contract violation: begin/complete called out of order. Always a bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("step {pending} was begun but never completed")]
    StepAlreadyPending { pending: usize },
    #[error("no step is pending")]
    NoPendingStep,
    #[error("the done marker must be appended with append_done, not complete_step")]
    MisplacedDone,
    #[error("trajectory already ends with a done marker")]
    Sealed,
}

/// Failure reported by the VM interface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("VM did not answer `{operation}` within {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("VM unreachable during `{operation}`: {reason}")]
    Fatal { operation: String, reason: String },
    #[error("VM rejected `{command}`: {reason}")]
    Rejected { command: String, reason: String },
    #[error("VM returned an unreadable screenshot: {0}")]
    BadScreenshot(String),
}

impl VmError {
    /// Connectivity loss. Ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::Fatal { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, VmError::Timeout { .. })
    }
}

#[derive(Debug, Error)]
#[error("failed to persist {}: {source}", path.display())]
pub struct PersistenceError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl PersistenceError {
    pub fn new(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("no evaluation command configured")]
    Unavailable,
    #[error("failed to launch evaluator `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("evaluator exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("evaluator printed no usable score: {output:?}")]
    Unparsable { output: String },
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no task matches `{0}`")]
    NotFound(String),
    #[error("task file lists no resolvable tasks")]
    Empty,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Session-level failure surfaced to the caller of the interaction loop.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("`{operation}` is not allowed while the session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error(
        "cannot wait {seconds} s: waits must be positive and at most {} s",
        crate::action::MAX_WAIT_SECS
    )]
    InvalidWait { seconds: f32 },
    #[error("step {index} failed and must be retried or skipped first")]
    UnresolvedFailure { index: usize },
    #[error("session aborted: {reason}")]
    Aborted { reason: String },
}
