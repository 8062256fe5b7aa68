//! Lifecycle of the traced command: spawn held, release, reap, kill.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{flatten, SessionError};
use crate::target::process_exists;
use crate::traced_command::{spawn_held_child, HeldChild};

/// Result of a non-blocking reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitObservation {
    /// A child exited; `status` is its exit code, or 128 + signal.
    Exited { pid: i32, status: i32 },
    /// There are no children left to wait for.
    NoChildren,
    /// Children exist but none changed state.
    NoChange,
}

/// Process-lifecycle queries the termination checks rely on.
pub trait ProcessProbe {
    fn is_alive(&self, pid: i32) -> bool;
    fn reap_nonblocking(&self, wait_all: bool) -> ExitObservation;
}

/// A zombie still answers the null signal until its parent reaps it.
fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let end = stat.rfind(')')?;
            Some(stat[end + 1..].trim_start().starts_with(['Z', 'X']))
        })
        .unwrap_or(false)
}

fn exit_code(status: WaitStatus) -> Option<(i32, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), code)),
        WaitStatus::Signaled(pid, sig, _) => Some((pid.as_raw(), 128 + sig as i32)),
        _ => None,
    }
}

/// Owns the (at most one) spawned command and the pid-to-kill marker.
///
/// The marker is set as soon as the command is spawned and is cleared only
/// when its exit is observed. Every transition goes through an atomic swap,
/// so the normal path and teardown cannot both kill the same pid.
#[derive(Default)]
pub struct Supervisor {
    pid_to_kill: AtomicI32,
    released: AtomicBool,
    held: Mutex<Option<HeldChild>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register as reaper of orphaned descendants so grandchildren are
    /// reparented to us instead of init. Must happen before any spawn.
    pub fn become_subreaper(&self) -> Result<(), SessionError> {
        nix::sys::prctl::set_child_subreaper(true).map_err(SessionError::SubreaperSetupError)?;
        debug!("set 'child subreaper' attribute");
        Ok(())
    }

    /// Spawn `argv` stopped before exec and mark it for killing on abort.
    pub fn spawn_held(&self, argv: &[String]) -> Result<i32, SessionError> {
        let child = spawn_held_child(argv).map_err(|e| SessionError::SpawnError(flatten(&e)))?;
        let pid = child.pid;
        self.pid_to_kill.store(pid, Ordering::SeqCst);
        *self.held.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        info!("Started command (PID {pid}), held until probes are attached");
        Ok(pid)
    }

    /// Let the held command go. Only the first call does anything.
    pub fn release(&self, pid: i32) -> Result<(), SessionError> {
        if self.released.swap(true, Ordering::SeqCst) {
            warn!("PID {pid} was already released");
            return Ok(());
        }
        kill(Pid::from_raw(pid), Signal::SIGCONT)
            .map_err(|e| SessionError::SpawnError(format!("cannot continue PID {pid}: {e}")))?;

        let held = self.held.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut child) = held {
            child
                .wait_for_exec()
                .map_err(|e| SessionError::SpawnError(flatten(&e)))?;
        }
        debug!("Released PID {pid}");
        Ok(())
    }

    /// Pid that teardown would kill, if any.
    pub fn marked(&self) -> Option<i32> {
        match self.pid_to_kill.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Clear the marker if it still names `pid`.
    pub fn unmark(&self, pid: i32) {
        let _ = self
            .pid_to_kill
            .compare_exchange(pid, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// SIGKILL and reap the marked pid. No-op when nothing is marked, so it
    /// is safe to call any number of times.
    pub fn kill_if_marked(&self) {
        let pid = self.pid_to_kill.swap(0, Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => info!("Killed the started child (PID {pid})"),
            Err(Errno::ESRCH) => return,
            Err(e) => {
                warn!("Failed to kill PID {pid}: {e}");
                return;
            }
        }
        match waitpid(Pid::from_raw(pid), None) {
            Ok(_) | Err(Errno::ECHILD) => {}
            Err(e) => warn!("Failed to reap PID {pid}: {e}"),
        }
    }
}

impl ProcessProbe for Supervisor {
    fn is_alive(&self, pid: i32) -> bool {
        process_exists(pid) && !is_zombie(pid)
    }

    fn reap_nonblocking(&self, wait_all: bool) -> ExitObservation {
        let mut last = ExitObservation::NoChange;
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return last,
                Ok(status) => {
                    if let Some((pid, code)) = exit_code(status) {
                        self.unmark(pid);
                        debug!("Reaped PID {pid} (status {code})");
                        last = ExitObservation::Exited { pid, status: code };
                        if !wait_all {
                            return last;
                        }
                    }
                }
                Err(Errno::ECHILD) => {
                    // A reap in this same call still counts as the answer
                    // for single-child waits.
                    return if wait_all || last == ExitObservation::NoChange {
                        ExitObservation::NoChildren
                    } else {
                        last
                    };
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("waitpid failed: {e}");
                    return last;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_if_marked_without_mark_is_noop() {
        let supervisor = Supervisor::new();
        supervisor.kill_if_marked();
        supervisor.kill_if_marked();
        assert_eq!(supervisor.marked(), None);
    }

    #[test]
    fn test_unmark_only_matching_pid() {
        let supervisor = Supervisor::new();
        supervisor.pid_to_kill.store(100, Ordering::SeqCst);
        supervisor.unmark(200);
        assert_eq!(supervisor.marked(), Some(100));
        supervisor.unmark(100);
        assert_eq!(supervisor.marked(), None);
    }

    #[test]
    fn test_spawn_error_for_missing_command() {
        let supervisor = Supervisor::new();
        let err = supervisor
            .spawn_held(&["definitely-not-a-command-xyz".to_string()])
            .unwrap_err();
        assert!(matches!(err, SessionError::SpawnError(_)));
        assert_eq!(supervisor.marked(), None);
    }

    #[test]
    fn test_self_is_alive() {
        let supervisor = Supervisor::new();
        assert!(supervisor.is_alive(std::process::id() as i32));
        assert!(!is_zombie(std::process::id() as i32));
    }

    #[test]
    fn test_exit_code_mapping() {
        let pid = Pid::from_raw(10);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 3)), Some((10, 3)));
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some((10, 137))
        );
        assert_eq!(exit_code(WaitStatus::StillAlive), None);
    }
}
