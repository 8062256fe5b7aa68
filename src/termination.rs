//! Termination conditions of the session loop.
//!
//! Flags raised asynchronously (signal handler, dispatcher) live in
//! [`TerminationState`] and are only written through its setters. The
//! per-mode process-liveness rule is a [`LivenessCheck`] picked once at
//! startup.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::poll::ShutdownSignal;
use crate::supervisor::{ExitObservation, ProcessProbe};
use crate::target::TracingMode;

/// Why the loop left ARMED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Writing to the output sink failed.
    OutputError,
    /// A terminating signal was received.
    Aborted,
    /// The traced command exited.
    ChildExited { pid: i32, status: i32 },
    /// The command and all of its descendants exited.
    DescendantsExited,
    /// The process traced by PID no longer exists.
    TargetVanished { pid: i32 },
}

impl StopReason {
    /// Process exits are the only stops after which the readers are drained
    /// one last time: those events were captured before the exit.
    pub fn drains_readers(&self) -> bool {
        matches!(
            self,
            StopReason::ChildExited { .. } | StopReason::DescendantsExited
        )
    }
}

/// Flags shared with the signal handler.
#[derive(Debug)]
pub struct TerminationState {
    output_error: AtomicBool,
    abort: AtomicBool,
    wake: ShutdownSignal,
}

impl TerminationState {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            output_error: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            wake: ShutdownSignal::new()?,
        })
    }

    /// Set the abort flag and interrupt the blocking wait.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.wake.signal();
    }

    pub fn set_output_error(&self) {
        self.output_error.store(true, Ordering::SeqCst);
    }

    pub fn output_failed(&self) -> bool {
        self.output_error.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn wake_signal(&self) -> &ShutdownSignal {
        &self.wake
    }

    /// Flag-driven stop, output errors first.
    pub fn pending(&self) -> Option<StopReason> {
        if self.output_failed() {
            Some(StopReason::OutputError)
        } else if self.aborted() {
            Some(StopReason::Aborted)
        } else {
            None
        }
    }
}

/// Route SIGINT, SIGTERM and SIGHUP to [`TerminationState::request_abort`].
///
/// A second handler cannot be installed in the same process, which only
/// happens when several sessions share a test binary; that is not an error.
pub fn install_abort_handler(state: Arc<TerminationState>) {
    match ctrlc::set_handler(move || state.request_abort()) {
        Ok(()) => debug!("Installed termination signal handler"),
        Err(ctrlc::Error::MultipleHandlers) => {}
        Err(e) => warn!("Failed to install termination signal handler: {e}"),
    }
}

/// Mode-specific liveness rule evaluated once per loop iteration.
pub trait LivenessCheck {
    fn check(&mut self, procs: &dyn ProcessProbe) -> Option<StopReason>;
}

/// Whole-system tracing only stops on a flag.
pub struct SystemWide;

impl LivenessCheck for SystemWide {
    fn check(&mut self, _procs: &dyn ProcessProbe) -> Option<StopReason> {
        None
    }
}

/// Stop when the spawned command itself is reaped.
pub struct TrackedChild {
    pub pid: i32,
}

impl LivenessCheck for TrackedChild {
    fn check(&mut self, procs: &dyn ProcessProbe) -> Option<StopReason> {
        match procs.reap_nonblocking(false) {
            ExitObservation::Exited { pid, status } if pid == self.pid => {
                Some(StopReason::ChildExited { pid, status })
            }
            // Reaped elsewhere; nothing left to wait for
            ExitObservation::NoChildren => Some(StopReason::ChildExited {
                pid: self.pid,
                status: 0,
            }),
            _ => None,
        }
    }
}

/// Stop once the command and every reparented descendant are gone.
pub struct AllDescendants;

impl LivenessCheck for AllDescendants {
    fn check(&mut self, procs: &dyn ProcessProbe) -> Option<StopReason> {
        match procs.reap_nonblocking(true) {
            ExitObservation::NoChildren => Some(StopReason::DescendantsExited),
            _ => None,
        }
    }
}

/// Stop when a process traced by PID disappears.
pub struct ExistingProcess {
    pub pid: i32,
}

impl LivenessCheck for ExistingProcess {
    fn check(&mut self, procs: &dyn ProcessProbe) -> Option<StopReason> {
        if procs.is_alive(self.pid) {
            None
        } else {
            Some(StopReason::TargetVanished { pid: self.pid })
        }
    }
}

/// Pick the liveness rule for a session. `child` is the spawned pid in
/// command mode.
pub fn liveness_for(
    mode: &TracingMode,
    follow_forks: bool,
    child: Option<i32>,
) -> Box<dyn LivenessCheck> {
    match (mode, child) {
        (TracingMode::All, _) => Box::new(SystemWide),
        (TracingMode::Pid { pid }, _) => Box::new(ExistingProcess { pid: *pid }),
        (TracingMode::Command { .. }, _) if follow_forks => Box::new(AllDescendants),
        (TracingMode::Command { .. }, Some(pid)) => Box::new(TrackedChild { pid }),
        (TracingMode::Command { .. }, None) => Box::new(AllDescendants),
    }
}
