//! The tracing session: STARTING -> ARMED -> DRAINING -> STOPPED.
//!
//! [`Session::run`] drives a generated program through compile, attach, poll
//! and detach while supervising the traced process. Every exit path, error or
//! not, ends in [`Session::teardown`], which flushes the sink, detaches the
//! instrumentation and kills a still-marked child, in that order.

use std::io;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SessionError;
use crate::instrument::{ConsumeError, EventReader, InstrumentationBackend, InstrumentationContext};
use crate::output::EventDispatcher;
use crate::poll::{ChildWatch, Poller, Ready};
use crate::supervisor::Supervisor;
use crate::synth::{self, ProgramSynthesizer};
use crate::target::TracingMode;
use crate::termination::{liveness_for, LivenessCheck, StopReason, TerminationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Armed,
    Draining,
    Stopped,
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub reason: StopReason,
    /// Records handed to the dispatcher without a write error.
    pub events: u64,
}

pub struct Session<B: InstrumentationBackend, D: EventDispatcher> {
    config: Config,
    mode: TracingMode,
    synthesizer: Box<dyn ProgramSynthesizer>,
    // Dropped before the context so no fd outlives the readers it watches
    poller: Option<Poller>,
    watch: Option<ChildWatch>,
    context: InstrumentationContext<B>,
    dispatcher: D,
    supervisor: Supervisor,
    termination: Arc<TerminationState>,
    liveness: Option<Box<dyn LivenessCheck>>,
    state: SessionState,
    child: Option<i32>,
    events: u64,
    sink_error: Option<io::Error>,
}

impl<B: InstrumentationBackend, D: EventDispatcher> Session<B, D> {
    pub fn new(
        config: Config,
        mode: TracingMode,
        synthesizer: Box<dyn ProgramSynthesizer>,
        backend: B,
        dispatcher: D,
        termination: Arc<TerminationState>,
    ) -> Self {
        Self {
            config,
            mode,
            synthesizer,
            poller: None,
            watch: None,
            context: InstrumentationContext::new(backend),
            dispatcher,
            supervisor: Supervisor::new(),
            termination,
            liveness: None,
            state: SessionState::Starting,
            child: None,
            events: 0,
            sink_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> &TracingMode {
        &self.mode
    }

    /// PID of the spawned command, once started.
    pub fn child(&self) -> Option<i32> {
        self.child
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn context(&self) -> &InstrumentationContext<B> {
        &self.context
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    fn follows_descendants(&self) -> bool {
        self.config.follow_forks && matches!(self.mode, TracingMode::Command { .. })
    }

    /// Run the session to completion. Teardown has happened by the time this
    /// returns, whatever the outcome.
    pub fn run(&mut self) -> Result<SessionSummary, SessionError> {
        let result = self.start().and_then(|()| self.poll_until_stopped());
        let result = match result {
            Ok(reason) => self.drain(reason),
            Err(e) => Err(e),
        };
        self.teardown();
        result
    }

    fn start(&mut self) -> Result<(), SessionError> {
        if self.follows_descendants() {
            self.supervisor.become_subreaper()?;
        }

        let source = self.synthesizer.synthesize(&self.mode)?;
        let source = synth::apply_attach_code(&source, &self.mode, self.follows_descendants())?;
        let source = synth::expand_trace_header(&source);

        if self.config.debug {
            synth::dump_with_line_numbers(&mut io::stderr().lock(), &source).map_err(|source| {
                SessionError::Io {
                    stage: "debug",
                    source,
                }
            })?;
        }
        if let Some(path) = &self.config.save_header {
            synth::save_header(path).map_err(|source| SessionError::Io {
                stage: "save header",
                source,
            })?;
        }

        self.context.compile(&source)?;

        let target = match &self.mode {
            TracingMode::All => None,
            TracingMode::Command { argv } => {
                let pid = self.supervisor.spawn_held(argv)?;
                self.child = Some(pid);
                Some(pid)
            }
            TracingMode::Pid { pid } => Some(*pid),
        };
        if let Some(pid) = target {
            self.context.restrict_to(pid)?;
        }

        self.context.attach_all()?;

        let argv: &[String] = match &self.mode {
            TracingMode::Command { argv } => argv,
            _ => &[],
        };
        self.dispatcher
            .print_header(argv)
            .map_err(SessionError::HeaderWriteError)?;

        self.poller = Some(self.build_poller(target)?);
        self.liveness = Some(liveness_for(
            &self.mode,
            self.follows_descendants(),
            self.child,
        ));

        if let Some(pid) = self.child {
            self.supervisor.release(pid)?;
        }

        self.state = SessionState::Armed;
        info!("Tracing started");
        Ok(())
    }

    fn build_poller(&mut self, target: Option<i32>) -> Result<Poller, SessionError> {
        let io_err = |source| SessionError::Io {
            stage: "poll",
            source,
        };
        let mut poller = Poller::new().map_err(io_err)?;
        for (idx, reader) in self.context.readers().iter().enumerate() {
            poller.add_reader(idx, reader.raw_fd()).map_err(io_err)?;
        }
        poller
            .add_wake(self.termination.wake_signal())
            .map_err(io_err)?;

        self.watch = match target {
            None => None,
            Some(_) if self.follows_descendants() => ChildWatch::children(),
            Some(pid) => ChildWatch::pid(pid),
        };
        if let Some(watch) = &self.watch {
            poller.add_child_watch(watch).map_err(io_err)?;
        } else if target.is_some() {
            debug!("No process watch available, relying on event traffic to notice exits");
        }
        Ok(poller)
    }

    /// The ARMED loop: check termination, wait, dispatch.
    fn poll_until_stopped(&mut self) -> Result<StopReason, SessionError> {
        let Some(mut poller) = self.poller.take() else {
            return Err(SessionError::NoProbesAttached);
        };
        let result = loop {
            if let Some(reason) = self.check_termination() {
                break Ok(reason);
            }

            let ready = match poller.wait() {
                Ok(ready) => ready,
                Err(source) => {
                    break Err(SessionError::Io {
                        stage: "poll",
                        source,
                    })
                }
            };

            for source in ready {
                match source {
                    Ready::Reader(idx) => {
                        if self.termination.pending().is_none() {
                            self.consume_reader(idx);
                        }
                    }
                    Ready::Wake => self.termination.wake_signal().drain(),
                    Ready::Child => {
                        if let Some(watch) = self.watch.as_mut() {
                            watch.drain();
                        }
                    }
                }
            }
        };
        self.poller = Some(poller);
        result
    }

    /// Output error, then abort, then the per-mode liveness rule.
    fn check_termination(&mut self) -> Option<StopReason> {
        if let Some(reason) = self.termination.pending() {
            return Some(reason);
        }
        self.liveness
            .as_mut()
            .and_then(|check| check.check(&self.supervisor))
    }

    fn consume_reader(&mut self, idx: usize) {
        let Some(reader) = self.context.readers().get(idx) else {
            return;
        };
        let dispatcher = &mut self.dispatcher;
        let mut dispatch = |data: &[u8]| dispatcher.on_event(data);
        match reader.consume(&mut dispatch) {
            Ok(n) => self.events += n as u64,
            Err(ConsumeError::Dispatch(e)) => {
                error!("Error while writing to output: {e}");
                self.sink_error = Some(e);
                self.termination.set_output_error();
            }
            Err(ConsumeError::Reader(e)) => {
                warn!("Failed to consume events from {}: {e:#}", reader.name())
            }
        }
    }

    /// DRAINING: a last read of every reader after a process exit, then the
    /// sink flush. Maps the stop reason to the session outcome.
    fn drain(&mut self, reason: StopReason) -> Result<SessionSummary, SessionError> {
        self.state = SessionState::Draining;
        debug!("Stopping: {reason:?}");

        if reason.drains_readers() {
            for idx in 0..self.context.readers().len() {
                if self.termination.output_failed() {
                    break;
                }
                self.consume_reader(idx);
            }
        }

        if !self.termination.output_failed() {
            if let Err(e) = self.dispatcher.flush() {
                error!("Error while flushing output: {e}");
                self.sink_error = Some(e);
                self.termination.set_output_error();
            }
        }

        if self.termination.output_failed() {
            let err = self
                .sink_error
                .take()
                .unwrap_or_else(|| io::Error::other("output sink failed"));
            return Err(SessionError::SinkWriteError(err));
        }

        match reason {
            StopReason::TargetVanished { pid } => return Err(SessionError::TargetVanished { pid }),
            StopReason::Aborted => info!("Tracing aborted"),
            StopReason::ChildExited { pid, status } => {
                info!("Command (PID {pid}) exited with status {status}")
            }
            StopReason::DescendantsExited => info!("Command and all descendants exited"),
            StopReason::OutputError => {}
        }
        Ok(SessionSummary {
            reason,
            events: self.events,
        })
    }

    /// Flush the sink, detach all instrumentation, then kill the child if it
    /// is still marked. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        if let Err(e) = self.dispatcher.flush() {
            debug!("Flush during teardown failed: {e}");
        }
        self.poller = None;
        self.watch = None;
        self.context.detach_all();
        self.supervisor.kill_if_marked();
        self.state = SessionState::Stopped;
    }
}

impl<B: InstrumentationBackend, D: EventDispatcher> Drop for Session<B, D> {
    fn drop(&mut self) {
        self.teardown();
    }
}
