//! strace-ebpf library - syscall tracing sessions driven by a BPF program
//! generated at runtime.
//!
//! # Modules
//!
//! - [`target`] - Classify a request into a tracing mode
//! - [`synth`] - Generate the BPF program from templates and a syscall filter
//! - [`instrument`] - Compile, attach and read the generated program
//! - [`supervisor`] - Spawn, release, reap and kill the traced command
//! - [`session`] - The session state machine and teardown
//! - [`output`] - Render events as text or JSON

pub mod config;
pub mod error;
pub mod instrument;
pub mod output;
pub mod poll;
pub mod session;
pub mod supervisor;
pub mod synth;
pub mod target;
pub mod termination;
pub mod traced_command;

// Re-export for convenience
pub use config::{Config, OutputFormat};
pub use error::SessionError;
pub use session::{Session, SessionState, SessionSummary};
pub use target::TracingMode;
pub use termination::{StopReason, TerminationState};
