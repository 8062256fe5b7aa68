//! Rendering of syscall events to the output sink.
//!
//! The session hands every raw ring buffer record to an [`EventDispatcher`].
//! A write error returned from the dispatcher is fatal to the session; a
//! record that does not decode is logged and skipped.

mod types;

pub use types::*;

use std::fs::File;
use std::io::{self, BufWriter, Write};

use nix::errno::Errno;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{Config, OutputFormat};
use crate::error::SessionError;
use crate::synth::catalog::no_return_numbers;
use crate::synth::syscall_name;

/// Receives raw event buffers and renders them to a sink.
pub trait EventDispatcher {
    /// Written once, before polling begins.
    fn print_header(&mut self, argv: &[String]) -> io::Result<()>;

    fn on_event(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

#[derive(Serialize)]
struct JsonHeader<'a> {
    tracer: &'static str,
    version: &'static str,
    command: &'a [String],
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    ts: u64,
    duration_ns: u64,
    pid: i32,
    tid: i32,
    comm: &'a str,
    syscall: &'a str,
    nr: i64,
    args: [u64; SC_ARGS_MAX],
    #[serde(skip_serializing_if = "Option::is_none")]
    ret: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    errno: Option<String>,
}

/// Name of a negative syscall return value, e.g. `ENOENT`.
fn errno_name(ret: i64) -> Option<String> {
    if !(-4095..0).contains(&ret) {
        return None;
    }
    match Errno::from_raw(-ret as i32) {
        Errno::UnknownErrno => None,
        errno => Some(format!("{errno:?}")),
    }
}

/// Text and JSON renderer over any writer.
pub struct OutputWriter<W: Write> {
    out: W,
    format: OutputFormat,
    separator: char,
    no_return: Vec<u32>,
    events: u64,
    skipped: u64,
}

impl<W: Write> OutputWriter<W> {
    pub fn new(out: W, format: OutputFormat, separator: char) -> Self {
        Self {
            out,
            format,
            separator,
            no_return: no_return_numbers(),
            events: 0,
            skipped: 0,
        }
    }

    /// Number of events written.
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Number of records that could not be decoded.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    fn returns(&self, event: &SyscallEvent) -> bool {
        u32::try_from(event.sc_id)
            .map(|nr| !self.no_return.contains(&nr))
            .unwrap_or(true)
    }

    fn write_text(&mut self, event: &SyscallEvent) -> io::Result<()> {
        let sep = self.separator;
        let name = syscall_name(event.sc_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("syscall_{}", event.sc_id));
        let args = event
            .args
            .iter()
            .map(|a| format!("{a:#x}"))
            .collect::<Vec<_>>()
            .join(", ");

        write!(
            self.out,
            "{}.{:06}{sep}{}{sep}{}{sep}{}{sep}{name}({args}) = ",
            event.start_ts / 1_000_000_000,
            (event.start_ts % 1_000_000_000) / 1_000,
            event.pid(),
            event.tid(),
            event.comm(),
        )?;
        if !self.returns(event) {
            return writeln!(self.out, "?");
        }
        match errno_name(event.ret) {
            Some(errno) => writeln!(
                self.out,
                "-1 {errno} <{:.6}>",
                event.duration_ns() as f64 / 1e9
            ),
            None => writeln!(
                self.out,
                "{} <{:.6}>",
                event.ret,
                event.duration_ns() as f64 / 1e9
            ),
        }
    }

    fn write_json(&mut self, event: &SyscallEvent) -> io::Result<()> {
        let comm = event.comm();
        let fallback;
        let syscall = match syscall_name(event.sc_id) {
            Some(name) => name,
            None => {
                fallback = format!("syscall_{}", event.sc_id);
                fallback.as_str()
            }
        };
        let returns = self.returns(event);
        let record = JsonEvent {
            ts: event.start_ts,
            duration_ns: event.duration_ns(),
            pid: event.pid(),
            tid: event.tid(),
            comm: &comm,
            syscall,
            nr: event.sc_id,
            args: event.args,
            ret: returns.then_some(event.ret),
            errno: if returns { errno_name(event.ret) } else { None },
        };
        serde_json::to_writer(&mut self.out, &record)?;
        writeln!(self.out)
    }
}

impl<W: Write> EventDispatcher for OutputWriter<W> {
    fn print_header(&mut self, argv: &[String]) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => {
                if !argv.is_empty() {
                    writeln!(self.out, "# {}", argv.join(" "))?;
                }
                let sep = self.separator;
                writeln!(
                    self.out,
                    "# TIMESTAMP{sep}PID{sep}TID{sep}COMM{sep}SYSCALL(ARGS) = RET <DURATION>"
                )
            }
            OutputFormat::Json => {
                let header = JsonHeader {
                    tracer: env!("CARGO_PKG_NAME"),
                    version: env!("CARGO_PKG_VERSION"),
                    command: argv,
                };
                serde_json::to_writer(&mut self.out, &header)?;
                writeln!(self.out)
            }
        }
    }

    fn on_event(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(event) = SyscallEvent::from_bytes(data) else {
            self.skipped += 1;
            warn!(
                "Skipping short event record ({} bytes, expected {})",
                data.len(),
                std::mem::size_of::<SyscallEvent>()
            );
            return Ok(());
        };
        match self.format {
            OutputFormat::Text => self.write_text(&event)?,
            OutputFormat::Json => self.write_json(&event)?,
        }
        self.events += 1;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Open stdout or the configured file, buffered by `out_buf_size` bytes.
pub fn open_sink(config: &Config) -> Result<BufWriter<Box<dyn Write>>, SessionError> {
    let inner: Box<dyn Write> = match &config.output {
        Some(path) => {
            debug!("Writing events to {}", path.display());
            Box::new(File::create(path).map_err(SessionError::OutputSetup)?)
        }
        None => Box::new(io::stdout()),
    };
    Ok(BufWriter::with_capacity(config.out_buf_size.max(1), inner))
}

/// Dispatcher used by the binary.
pub type SinkWriter = OutputWriter<BufWriter<Box<dyn Write>>>;

impl SinkWriter {
    pub fn from_config(config: &Config) -> Result<Self, SessionError> {
        Ok(OutputWriter::new(
            open_sink(config)?,
            config.format,
            config.field_separator,
        ))
    }
}
