//! Error taxonomy for a tracing session.
//!
//! Lower layers (clang, libbpf-rs, process plumbing) report `anyhow` errors
//! with context. The orchestrator maps them into [`SessionError`] at the
//! stage where they happen, so the binary can print one diagnostic line and
//! pick an exit code.

use std::io;

use thiserror::Error;

/// Exit code for failures that happen before instrumentation is armed.
pub const EXIT_STARTUP_FAILURE: i32 = 1;

/// Exit code for failures detected while the session loop was running.
pub const EXIT_ARMED_FAILURE: i32 = 2;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("command and PID cannot be set together")]
    ConfigConflict,

    #[error("process with PID '{pid}' does not exist")]
    TargetNotFound { pid: i32 },

    #[error("unknown syscall or group '{name}' in filter")]
    UnknownSyscall { name: String },

    #[error("cannot generate BPF program: {0}")]
    Synthesis(String),

    #[error("cannot compile BPF program: {0}")]
    CompileError(String),

    #[error("no probes were attached")]
    NoProbesAttached,

    #[error("failed to start the command: {0}")]
    SpawnError(String),

    #[error("failed to set 'child subreaper' attribute: {0}")]
    SubreaperSetupError(#[source] nix::Error),

    #[error("failed to set up the output: {0}")]
    OutputSetup(#[source] io::Error),

    #[error("error while printing header: {0}")]
    HeaderWriteError(#[source] io::Error),

    #[error("error while writing to output: {0}")]
    SinkWriteError(#[source] io::Error),

    #[error("traced process with PID '{pid}' disappeared")]
    TargetVanished { pid: i32 },

    #[error("I/O error during {stage}: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    /// Whether the failure was detected after the session reached ARMED.
    pub fn is_armed(&self) -> bool {
        matches!(
            self,
            SessionError::SinkWriteError(_) | SessionError::TargetVanished { .. }
        )
    }

    /// Process exit code reported for this failure.
    pub fn exit_code(&self) -> i32 {
        if self.is_armed() {
            EXIT_ARMED_FAILURE
        } else {
            EXIT_STARTUP_FAILURE
        }
    }

    /// Short name of the stage that failed, used as the diagnostic prefix.
    pub fn stage(&self) -> &'static str {
        match self {
            SessionError::ConfigConflict
            | SessionError::TargetNotFound { .. }
            | SessionError::UnknownSyscall { .. } => "config",
            SessionError::Synthesis(_) => "generate",
            SessionError::CompileError(_) => "compile",
            SessionError::NoProbesAttached => "attach",
            SessionError::SpawnError(_) | SessionError::SubreaperSetupError(_) => "spawn",
            SessionError::OutputSetup(_) | SessionError::HeaderWriteError(_) => "output",
            SessionError::SinkWriteError(_) => "output",
            SessionError::TargetVanished { .. } => "trace",
            SessionError::Io { stage, .. } => stage,
        }
    }
}

/// Flatten an `anyhow` chain into a single line for the taxonomy variants
/// that carry a message.
pub(crate) fn flatten(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
