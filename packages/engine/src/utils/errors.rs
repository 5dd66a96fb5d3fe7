// packages/engine/src/utils/errors.rs
//! Error taxonomy for the engine
//!
//! Errors fall into four families:
//!
//! - **Soft**: reported by the worker's own application logic. The worker
//!   stays usable.
//! - **Allocation / timeout**: no free workers, allocation failed, deadline
//!   exceeded. Always surfaced to the caller.
//! - **Protocol**: CRC mismatch, malformed frame, PID mismatch, broken relay.
//!   Always fatal to the worker.
//! - **Process**: non-zero exit or signal death, surfaced through `wait()`.

use std::fmt;
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Job-level error reported by the worker (ERROR flag set on the response frame)
    #[error("soft job error: {0}")]
    SoftJob(String),

    #[error("payload can not be empty")]
    EmptyPayload,

    #[error("worker {pid} is not ready ({state})")]
    WorkerNotReady { pid: u32, state: String },

    #[error("no free workers in the container, timeout exceeded")]
    NoFreeWorkers,

    #[error("worker watcher stopped")]
    WatcherStopped,

    #[error("failed to allocate worker: {0}")]
    WorkerAllocate(String),

    /// Per-execution deadline hit while the worker was busy
    #[error("worker execution deadline exceeded")]
    ExecTTL,

    /// Supervisor-level exec timeout
    #[error("supervised execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("frame CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("handshake pid mismatch: spawned {expected}, relay reported {actual}")]
    PidMismatch { expected: u32, actual: u32 },

    #[error("relay closed by peer")]
    RelayClosed,

    #[error("relay is not attached")]
    RelayNotAttached,

    #[error("worker {pid} exited with {status}{}", stderr_suffix(.stderr))]
    ProcessExited {
        pid: u32,
        status: String,
        stderr: String,
    },

    #[error("failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    #[error("worker requested stop twice for the same payload")]
    StopLoop,

    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Several failures collected from one operation (e.g. spawn cleanup)
    #[error("{}", JoinedErrors(.0))]
    Multiple(Vec<EngineError>),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr.trim_end())
    }
}

struct JoinedErrors<'a>(&'a [EngineError]);

impl fmt::Display for JoinedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl EngineError {
    /// Combine a primary error with follow-up cleanup results.
    ///
    /// Successful cleanup steps are dropped; a lone error is returned as is.
    pub fn combine(primary: EngineError, cleanup: impl IntoIterator<Item = Result<()>>) -> Self {
        let mut errors = vec![primary];
        errors.extend(cleanup.into_iter().filter_map(|r| r.err()));

        if errors.len() == 1 {
            errors.remove(0)
        } else {
            EngineError::Multiple(errors)
        }
    }

    /// Job-level error: the worker may stay in the pool
    pub fn is_soft(&self) -> bool {
        matches!(self, EngineError::SoftJob(_))
    }

    /// Relay state can no longer be trusted
    pub fn is_protocol(&self) -> bool {
        match self {
            EngineError::CrcMismatch { .. }
            | EngineError::MalformedFrame(_)
            | EngineError::PidMismatch { .. }
            | EngineError::RelayClosed
            | EngineError::RelayNotAttached => true,
            EngineError::Multiple(errs) => errs.iter().any(|e| e.is_protocol()),
            _ => false,
        }
    }

    /// Any deadline / timeout flavour
    pub fn is_timeout(&self) -> bool {
        match self {
            EngineError::ExecTTL | EngineError::Timeout(_) | EngineError::NoFreeWorkers => true,
            EngineError::Multiple(errs) => errs.iter().any(|e| e.is_timeout()),
            _ => false,
        }
    }

    /// Short label used for metrics and events
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::SoftJob(_) => "soft_job",
            EngineError::EmptyPayload => "empty_payload",
            EngineError::WorkerNotReady { .. } => "not_ready",
            EngineError::NoFreeWorkers => "no_free_workers",
            EngineError::WatcherStopped => "watcher_stopped",
            EngineError::WorkerAllocate(_) => "allocate",
            EngineError::ExecTTL => "exec_ttl",
            EngineError::Timeout(_) => "timeout",
            EngineError::CrcMismatch { .. } => "crc_mismatch",
            EngineError::MalformedFrame(_) => "malformed_frame",
            EngineError::PidMismatch { .. } => "pid_mismatch",
            EngineError::RelayClosed | EngineError::RelayNotAttached => "relay",
            EngineError::ProcessExited { .. } => "process_exit",
            EngineError::ProcessSpawnFailed(_) => "spawn",
            EngineError::StopLoop => "stop_loop",
            EngineError::Io(_) => "io",
            EngineError::Json(_) => "json",
            EngineError::Config(_) | EngineError::InvalidConfig(_) => "config",
            EngineError::RuntimeError(_) => "runtime",
            EngineError::Multiple(_) => "multiple",
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
