//! Instrumentation context: compiled program, attached probes, readers.
//!
//! The context is generic over an [`InstrumentationBackend`] so the session
//! can be driven without kernel privileges in tests. The production backend
//! lives in [`libbpf`].

pub mod libbpf;

use std::io;
use std::os::fd::RawFd;

use tracing::{debug, info, warn};

use crate::error::SessionError;

/// Error from consuming one reader.
#[derive(Debug)]
pub enum ConsumeError {
    /// The dispatcher failed to write an event. Events after it in the same
    /// batch are dropped.
    Dispatch(io::Error),
    /// The reader itself failed; the session keeps going.
    Reader(anyhow::Error),
}

/// One live event stream.
pub trait EventReader {
    fn name(&self) -> &str;

    /// fd that polls readable when the stream has data.
    fn raw_fd(&self) -> RawFd;

    /// Hand every pending raw record to `dispatch`, in capture order.
    /// Stops at the first dispatch error. Returns the number of records
    /// dispatched.
    fn consume(
        &self,
        dispatch: &mut dyn FnMut(&[u8]) -> io::Result<()>,
    ) -> Result<usize, ConsumeError>;
}

/// Outcome of attaching every probe a program declares.
pub struct Attachment<P, R> {
    pub probes: Vec<(String, P)>,
    pub readers: Vec<R>,
    /// Probes that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Kernel-side mechanics behind the context.
pub trait InstrumentationBackend {
    type Program;
    /// Dropping a probe detaches it.
    type Probe;
    type Reader: EventReader;

    fn compile(&mut self, source: &str) -> anyhow::Result<Self::Program>;

    /// Limit the program to `pid` (and, with fork tracking, its children).
    fn restrict_to(&mut self, program: &mut Self::Program, pid: i32) -> anyhow::Result<()>;

    fn attach_all(
        &mut self,
        program: &mut Self::Program,
    ) -> anyhow::Result<Attachment<Self::Probe, Self::Reader>>;
}

/// Owns everything attached to the kernel for one session.
///
/// Probes and readers are appended together by [`attach_all`] and only ever
/// released together by [`detach_all`]. The context is either fully
/// attached or torn down.
///
/// [`attach_all`]: InstrumentationContext::attach_all
/// [`detach_all`]: InstrumentationContext::detach_all
pub struct InstrumentationContext<B: InstrumentationBackend> {
    // Field order is drop order: readers, then probes, then the program.
    readers: Vec<B::Reader>,
    probes: Vec<(String, B::Probe)>,
    program: Option<B::Program>,
    backend: B,
}

impl<B: InstrumentationBackend> InstrumentationContext<B> {
    pub fn new(backend: B) -> Self {
        Self {
            readers: Vec::new(),
            probes: Vec::new(),
            program: None,
            backend,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_compiled(&self) -> bool {
        self.program.is_some()
    }

    pub fn is_attached(&self) -> bool {
        !self.probes.is_empty()
    }

    pub fn probe_names(&self) -> impl Iterator<Item = &str> {
        self.probes.iter().map(|(name, _)| name.as_str())
    }

    /// Compile and load `source`. Nothing is attached yet, so a failure only
    /// drops whatever the backend built.
    pub fn compile(&mut self, source: &str) -> Result<(), SessionError> {
        info!("Compiling generated BPF code...");
        let program = self
            .backend
            .compile(source)
            .map_err(|e| SessionError::CompileError(crate::error::flatten(&e)))?;
        self.program = Some(program);
        Ok(())
    }

    pub fn restrict_to(&mut self, pid: i32) -> Result<(), SessionError> {
        let program = self.program.as_mut().ok_or_else(|| {
            SessionError::CompileError("program must be compiled before filtering".to_string())
        })?;
        self.backend
            .restrict_to(program, pid)
            .map_err(|e| SessionError::CompileError(crate::error::flatten(&e)))?;
        debug!("Restricted program to PID {pid}");
        Ok(())
    }

    /// Attach every probe. Partial attachment is accepted with a warning;
    /// zero attached probes is a startup failure and leaves nothing behind.
    pub fn attach_all(&mut self) -> Result<usize, SessionError> {
        info!("Attaching probes...");
        let program = self.program.as_mut().ok_or(SessionError::NoProbesAttached)?;
        let attachment = match self.backend.attach_all(program) {
            Ok(attachment) => attachment,
            Err(e) => {
                warn!("Failed to attach probes: {e:#}");
                return Err(SessionError::NoProbesAttached);
            }
        };

        for (name, reason) in &attachment.failed {
            warn!("Probe '{name}' failed to attach - some data may be missing: {reason}");
        }

        if attachment.probes.is_empty() || attachment.readers.is_empty() {
            // Dropping the attachment releases any readers and probes
            return Err(SessionError::NoProbesAttached);
        }

        if !attachment.failed.is_empty() {
            warn!(
                "{} probe(s) failed to attach. Check dmesg for BPF errors.",
                attachment.failed.len()
            );
        }

        let count = attachment.probes.len();
        self.probes.extend(attachment.probes);
        self.readers.extend(attachment.readers);
        info!(
            "Attached {count} probe(s), {} event reader(s)",
            self.readers.len()
        );
        Ok(count)
    }

    /// Live readers. Never changes once attach has completed.
    pub fn readers(&self) -> &[B::Reader] {
        &self.readers
    }

    /// Release every reader, probe and the program. Idempotent.
    pub fn detach_all(&mut self) {
        if self.readers.is_empty() && self.probes.is_empty() && self.program.is_none() {
            return;
        }
        debug!(
            "Detaching {} probe(s) and {} reader(s)",
            self.probes.len(),
            self.readers.len()
        );
        self.readers.clear();
        self.probes.clear();
        self.program = None;
    }
}

impl<B: InstrumentationBackend> Drop for InstrumentationContext<B> {
    fn drop(&mut self) {
        self.detach_all();
    }
}
