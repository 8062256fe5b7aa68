//! Classify a tracing request into exactly one mode.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::warn;

use crate::config::Config;
use crate::error::SessionError;

/// What a session traces. Derived once from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TracingMode {
    /// Every syscall in the system.
    All,
    /// A command started by the tracer.
    Command { argv: Vec<String> },
    /// A process that was already running.
    Pid { pid: i32 },
}

impl TracingMode {
    /// Whether the generated program must filter on `target_pids`.
    pub fn is_scoped(&self) -> bool {
        !matches!(self, TracingMode::All)
    }
}

/// Check whether a process exists by sending it the null signal.
///
/// `EPERM` still means the process exists, we just may not signal it.
pub fn process_exists(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Resolve the configuration into a [`TracingMode`].
///
/// Never spawns anything. The only side effect is the warning emitted when
/// nothing scopes the trace.
pub fn resolve(config: &Config) -> Result<TracingMode, SessionError> {
    let command = config.command.as_ref().filter(|argv| !argv.is_empty());

    if command.is_some() && config.pid.is_some() {
        return Err(SessionError::ConfigConflict);
    }

    if let Some(pid) = config.pid {
        if pid <= 0 || !process_exists(pid) {
            return Err(SessionError::TargetNotFound { pid });
        }
        return Ok(TracingMode::Pid { pid });
    }

    if let Some(argv) = command {
        return Ok(TracingMode::Command { argv: argv.clone() });
    }

    warn!("will trace all syscalls in the system...");
    Ok(TracingMode::All)
}
