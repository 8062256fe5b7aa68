//! Command line failures that happen before any kernel state is created.

use std::process::{Command, Output};

fn run_strace(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_strace-ebpf"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run strace-ebpf")
}

#[test]
fn test_help() {
    let output = run_strace(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--follow-forks"));
    assert!(stdout.contains("--pid"));
}

#[test]
fn test_command_and_pid_conflict() {
    let output = run_strace(&["-p", "1", "--", "/bin/true"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("command and PID cannot be set together"),
        "{stderr}"
    );
    assert!(output.stdout.is_empty());
}

#[test]
fn test_missing_pid() {
    // Above the kernel's PID_MAX_LIMIT, so it can never exist
    let output = run_strace(&["-p", "99999999"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("99999999"), "{stderr}");
}

#[test]
fn test_unknown_syscall_filter() {
    let output = run_strace(&["-e", "not_a_syscall", "--", "/bin/true"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not_a_syscall"), "{stderr}");
}

#[test]
#[ignore] // Requires root/BPF privileges and clang
fn test_e2e_trace_command() {
    let output = run_strace(&["--", "/bin/true"]);
    assert!(
        output.status.success(),
        "strace-ebpf failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("# /bin/true\n"));
    assert!(stdout.contains("execve("), "{stdout}");
    assert!(stdout.contains("exit_group("), "{stdout}");
}

#[test]
#[ignore] // Requires root/BPF privileges and clang
fn test_e2e_json_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");
    let output = run_strace(&[
        "--format",
        "json",
        "-o",
        path.to_str().unwrap(),
        "-e",
        "%process",
        "--",
        "/bin/true",
    ]);
    assert!(output.status.success());
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    let header: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
    assert_eq!(header["command"][0], "/bin/true");
    assert!(lines.any(|l| l.contains("\"syscall\":\"exit_group\"")));
}
