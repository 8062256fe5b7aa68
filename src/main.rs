use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use strace_ebpf::config::{Config, OutputFormat, OUT_BUF_SIZE, RING_PAGES_DEFAULT};
use strace_ebpf::instrument::libbpf::{bump_memlock_rlimit, check_jit_status, LibbpfBackend};
use strace_ebpf::output::SinkWriter;
use strace_ebpf::poll::block_child_signal;
use strace_ebpf::session::Session;
use strace_ebpf::synth::TemplateSynthesizer;
use strace_ebpf::termination::{install_abort_handler, TerminationState};
use strace_ebpf::{target, SessionError};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

impl From<Format> for OutputFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Text => OutputFormat::Text,
            Format::Json => OutputFormat::Json,
        }
    }
}

/// Trace syscalls with a BPF program generated at runtime.
///
/// Without a command or PID every syscall in the system is traced.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Trace an already running process
    #[arg(short, long)]
    pid: Option<i32>,
    /// Keep tracing until the command and all of its descendants exit
    #[arg(short, long)]
    follow_forks: bool,
    /// Write events to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "text")]
    format: Format,
    /// Separator between the fields of a text line
    #[arg(short = 's', long, default_value = " ")]
    separator: char,
    /// Output buffer size in bytes
    #[arg(long, default_value_t = OUT_BUF_SIZE)]
    out_buf_size: usize,
    /// Pages per BPF ring buffer
    #[arg(long, default_value_t = RING_PAGES_DEFAULT)]
    ring_pages: u32,
    /// Syscalls to trace: names, %groups (file, desc, process, network,
    /// memory) or "all"; comma separated, may be repeated
    #[arg(short = 'e', long = "syscalls", default_value = "all")]
    syscalls: Vec<String>,
    /// Print the generated BPF program with line numbers
    #[arg(short, long)]
    debug: bool,
    /// Save the event layout header to this path
    #[arg(long)]
    save_header: Option<PathBuf>,
    /// Compiler used to build the BPF program
    #[arg(long, default_value = "clang")]
    clang: PathBuf,
    /// Extra include directory for the BPF compiler
    #[arg(short = 'I', long = "include")]
    include_dirs: Vec<PathBuf>,
    /// Command to run and trace
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            verbosity: cli.verbose,
            command: (!cli.command.is_empty()).then_some(cli.command),
            pid: cli.pid,
            follow_forks: cli.follow_forks,
            output: cli.output,
            format: cli.format.into(),
            field_separator: cli.separator,
            out_buf_size: cli.out_buf_size,
            ring_pages: cli.ring_pages,
            syscalls: cli.syscalls,
            debug: cli.debug,
            save_header: cli.save_header,
            clang: cli.clang,
            include_dirs: cli.include_dirs,
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(config: Config) -> Result<(), SessionError> {
    let mode = target::resolve(&config)?;
    let synthesizer = TemplateSynthesizer::from_filters(&config.syscalls)?;

    bump_memlock_rlimit();
    check_jit_status();

    let termination = Arc::new(
        TerminationState::new().map_err(|source| SessionError::Io {
            stage: "signal",
            source,
        })?,
    );
    install_abort_handler(termination.clone());

    let dispatcher = SinkWriter::from_config(&config)?;
    let backend = LibbpfBackend::new(&config);
    let mut session = Session::new(
        config,
        mode,
        Box::new(synthesizer),
        backend,
        dispatcher,
        termination,
    );
    session.run()?;
    Ok(())
}

fn main() {
    let config = Config::from(Cli::parse());
    init_logging(config.verbosity);

    // Before ctrlc starts its thread, so every thread inherits the mask
    if let Err(e) = block_child_signal() {
        warn!("Failed to block SIGCHLD: {e}");
    }

    let code = match run(config) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}: {e}", e.stage());
            e.exit_code()
        }
    };
    process::exit(code);
}
