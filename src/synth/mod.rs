//! BPF program synthesis from templates.
//!
//! The synthesizer produces program text for a [`SyscallSet`]. The session
//! then applies the two post-processing transforms in this module before the
//! text is compiled: [`apply_attach_code`] and [`expand_trace_header`].

pub mod catalog;

use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::Path;

use tracing::debug;

use crate::error::SessionError;
use crate::target::TracingMode;
use catalog::{no_return_numbers, SyscallSet};

pub use catalog::syscall_name;

/// Header shared with the event decoder.
pub const TRACE_H: &str = include_str!("../bpf/trace.h");

const TRACE_HEAD: &str = include_str!("../bpf/trace_head.bpf.c");
const SYSCALLS_BODY: &str = include_str!("../bpf/syscalls.bpf.c");
const PID_CHECK: &str = include_str!("../bpf/pid_check.bpf.c");
const FOLLOW_FORK: &str = include_str!("../bpf/follow_fork.bpf.c");

const TRACE_H_INCLUDE: &str = "#include \"trace.h\"";
const PID_CHECK_HOOK: &str = "PID_CHECK_HOOK";
const SC_FILTER_BODY: &str = "SC_FILTER_BODY";

/// Produces the program text. The orchestrator treats the result as opaque.
pub trait ProgramSynthesizer {
    fn synthesize(&self, mode: &TracingMode) -> Result<String, SessionError>;
}

/// Synthesizer backed by the templates in `src/bpf/`.
pub struct TemplateSynthesizer {
    syscalls: SyscallSet,
}

impl TemplateSynthesizer {
    pub fn new(syscalls: SyscallSet) -> Self {
        Self { syscalls }
    }

    pub fn from_filters(filters: &[String]) -> Result<Self, SessionError> {
        Ok(Self::new(SyscallSet::from_filters(filters)?))
    }

    fn filter_functions(&self) -> String {
        let mut out = String::new();
        out.push_str("static __always_inline int sc_is_traced(long id)\n{\n");
        if self.syscalls.traces_all() {
            out.push_str("\treturn 1;\n");
        } else {
            out.push_str("\tswitch (id) {\n");
            for nr in self.syscalls.numbers() {
                let _ = writeln!(out, "\tcase {nr}:");
            }
            out.push_str("\t\treturn 1;\n\tdefault:\n\t\treturn 0;\n\t}\n");
        }
        out.push_str("}\n\n");

        out.push_str("static __always_inline int sc_no_return(long id)\n{\n");
        let checks: Vec<String> = no_return_numbers()
            .iter()
            .map(|nr| format!("id == {nr}"))
            .collect();
        if checks.is_empty() {
            out.push_str("\treturn 0;\n");
        } else {
            let _ = writeln!(out, "\treturn {};", checks.join(" || "));
        }
        out.push_str("}\n");
        out
    }
}

impl ProgramSynthesizer for TemplateSynthesizer {
    fn synthesize(&self, _mode: &TracingMode) -> Result<String, SessionError> {
        if !SYSCALLS_BODY.contains(SC_FILTER_BODY) {
            return Err(SessionError::Synthesis(format!(
                "syscall template lacks {SC_FILTER_BODY}"
            )));
        }
        let body = SYSCALLS_BODY.replacen(SC_FILTER_BODY, &self.filter_functions(), 1);
        Ok(format!("{TRACE_HEAD}{body}"))
    }
}

/// Inject the mode-specific attach code: the pid filter for scoped modes,
/// plus fork tracking when descendants are followed.
pub fn apply_attach_code(
    source: &str,
    mode: &TracingMode,
    follow_forks: bool,
) -> Result<String, SessionError> {
    if !source.contains(PID_CHECK_HOOK) {
        return Err(SessionError::Synthesis(format!(
            "program has no {PID_CHECK_HOOK} marker"
        )));
    }
    if !mode.is_scoped() {
        return Ok(source.replace(PID_CHECK_HOOK, ""));
    }
    let mut out = source.replace(PID_CHECK_HOOK, PID_CHECK.trim_end());
    if follow_forks {
        out.push_str(FOLLOW_FORK);
    }
    Ok(out)
}

/// Replace `#include "trace.h"` with the header itself, so the program
/// compiles without the header on disk.
pub fn expand_trace_header(source: &str) -> String {
    source.replace(TRACE_H_INCLUDE, TRACE_H.trim_end())
}

/// Persist the event layout header so other tools can decode the records.
pub fn save_header(path: &Path) -> io::Result<()> {
    std::fs::write(path, TRACE_H)?;
    debug!("Saved trace header to {}", path.display());
    Ok(())
}

/// Write `source` with line numbers, for matching verifier messages.
pub fn dump_with_line_numbers<W: Write>(out: &mut W, source: &str) -> io::Result<()> {
    writeln!(out, "---------------------------------- BPF program ---")?;
    for (i, line) in source.lines().enumerate() {
        writeln!(out, "{:4}: {}", i + 1, line)?;
    }
    writeln!(out, "---------------------------------- end ---")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use syscalls::Sysno;

    fn synth(filters: &[&str]) -> String {
        let filters: Vec<String> = filters.iter().map(|s| s.to_string()).collect();
        TemplateSynthesizer::from_filters(&filters)
            .unwrap()
            .synthesize(&TracingMode::All)
            .unwrap()
    }

    #[test]
    fn test_all_syscalls_program() {
        let text = synth(&["all"]);
        assert!(text.contains("int sc_is_traced(long id)\n{\n\treturn 1;"));
        assert!(text.contains("SEC(\"tracepoint/raw_syscalls/sys_enter\")"));
        assert!(text.contains(PID_CHECK_HOOK));
        assert!(!text.contains(SC_FILTER_BODY));
    }

    #[test]
    fn test_filtered_program_has_cases() {
        let text = synth(&["openat"]);
        let case = format!("case {}:", Sysno::openat.id());
        assert!(text.contains(&case));
        assert!(text.contains("default:\n\t\treturn 0;"));
    }

    #[test]
    fn test_no_return_check_names_exit_group() {
        let text = synth(&["all"]);
        assert!(text.contains(&format!("id == {}", Sysno::exit_group.id())));
    }

    #[test]
    fn test_attach_code_for_all_mode() {
        let text = apply_attach_code(&synth(&["all"]), &TracingMode::All, true).unwrap();
        assert!(!text.contains(PID_CHECK_HOOK));
        assert!(!text.contains("target_pids, &tgid"));
        assert!(!text.contains("sched_process_fork"));
    }

    #[test]
    fn test_attach_code_for_pid_mode() {
        let text =
            apply_attach_code(&synth(&["all"]), &TracingMode::Pid { pid: 1 }, false).unwrap();
        assert!(text.contains("bpf_map_lookup_elem(&target_pids, &tgid)"));
        assert!(!text.contains("sched_process_fork"));
    }

    #[test]
    fn test_attach_code_follows_forks() {
        let mode = TracingMode::Command {
            argv: vec!["/bin/true".to_string()],
        };
        let text = apply_attach_code(&synth(&["all"]), &mode, true).unwrap();
        assert!(text.contains("SEC(\"tracepoint/sched/sched_process_fork\")"));
    }

    #[test]
    fn test_attach_code_requires_marker() {
        assert!(matches!(
            apply_attach_code("int x;", &TracingMode::All, false),
            Err(SessionError::Synthesis(_))
        ));
    }

    #[test]
    fn test_header_expansion() {
        let text = expand_trace_header(&synth(&["all"]));
        assert!(!text.contains(TRACE_H_INCLUDE));
        assert!(text.contains("struct sc_event {"));
    }

    #[test]
    fn test_save_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.h");
        save_header(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), TRACE_H);
    }

    #[test]
    fn test_dump_numbers_lines() {
        let mut out = Vec::new();
        dump_with_line_numbers(&mut out, "a\nb").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("   1: a\n   2: b\n"));
    }
}
