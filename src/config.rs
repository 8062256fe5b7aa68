use std::path::PathBuf;

/// Default size of the output buffer in bytes.
pub const OUT_BUF_SIZE: usize = 64 * 1024;

/// Default number of pages backing each BPF ring buffer.
pub const RING_PAGES_DEFAULT: u32 = 256;

/// Output format of the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// strace-like text lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Configuration for a tracing session.
///
/// Built once from the command line and never mutated afterwards. Kept apart
/// from the CLI parser so the session can be driven from tests.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    pub verbosity: u8,
    /// Command to run and trace
    pub command: Option<Vec<String>>,
    /// Existing process to trace
    pub pid: Option<i32>,
    /// Keep tracing until every descendant of the command has exited
    pub follow_forks: bool,
    /// Output file (stdout when unset)
    pub output: Option<PathBuf>,
    pub format: OutputFormat,
    /// Separator between fields of a text line
    pub field_separator: char,
    /// Capacity of the buffered output writer
    pub out_buf_size: usize,
    /// Pages per BPF ring buffer; rounded up to a power of two
    pub ring_pages: u32,
    /// Syscall filter expressions ("all", names, or %groups)
    pub syscalls: Vec<String>,
    /// Dump the generated program with line numbers
    pub debug: bool,
    /// Write the expanded trace header to this path
    pub save_header: Option<PathBuf>,
    /// Compiler used to build the generated program
    pub clang: PathBuf,
    /// Extra include directories for the compiler
    pub include_dirs: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            command: None,
            pid: None,
            follow_forks: false,
            output: None,
            format: OutputFormat::Text,
            field_separator: ' ',
            out_buf_size: OUT_BUF_SIZE,
            ring_pages: RING_PAGES_DEFAULT,
            syscalls: vec!["all".to_string()],
            debug: false,
            save_header: None,
            clang: PathBuf::from("clang"),
            include_dirs: Vec::new(),
        }
    }
}

impl Config {
    /// Size in bytes of one ring buffer, as the kernel wants it: a power of
    /// two multiple of the page size.
    pub fn ring_bytes(&self) -> u32 {
        let page = page_size();
        let pages = self.ring_pages.max(1).next_power_of_two();
        pages.saturating_mul(page)
    }
}

fn page_size() -> u32 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_trace_everything() {
        let config = Config::default();
        assert_eq!(config.syscalls, vec!["all".to_string()]);
        assert!(config.command.is_none());
        assert!(config.pid.is_none());
        assert_eq!(config.format, OutputFormat::Text);
    }

    #[test]
    fn test_ring_bytes_rounds_to_power_of_two() {
        let config = Config {
            ring_pages: 100,
            ..Default::default()
        };
        let bytes = config.ring_bytes();
        assert!(bytes.is_power_of_two());
        assert_eq!(bytes, 128 * page_size());
    }

    #[test]
    fn test_ring_bytes_never_zero() {
        let config = Config {
            ring_pages: 0,
            ..Default::default()
        };
        assert_eq!(config.ring_bytes(), page_size());
    }
}
