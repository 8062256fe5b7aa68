use plain::Plain;

/// Maximum number of raw syscall arguments carried per event.
pub const SC_ARGS_MAX: usize = 6;

/// Length of the command name in an event.
pub const TASK_COMM_LEN: usize = 16;

/// Mirror of `struct sc_event` in `src/bpf/trace.h`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallEvent {
    /// ktime at syscall exit
    pub ts: u64,
    /// ktime at syscall entry
    pub start_ts: u64,
    pub pid_tid: u64,
    pub sc_id: i64,
    pub ret: i64,
    pub args: [u64; SC_ARGS_MAX],
    pub comm: [u8; TASK_COMM_LEN],
}

unsafe impl Plain for SyscallEvent {}

impl SyscallEvent {
    /// Copy a raw ring buffer record. `None` when the record is too short.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let mut event = SyscallEvent::default();
        plain::copy_from_bytes(&mut event, data).ok()?;
        Some(event)
    }

    pub fn pid(&self) -> i32 {
        pid_from_tgidpid(self.pid_tid)
    }

    pub fn tid(&self) -> i32 {
        tid_from_tgidpid(self.pid_tid)
    }

    pub fn comm(&self) -> String {
        let end = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TASK_COMM_LEN);
        String::from_utf8_lossy(&self.comm[..end]).into_owned()
    }

    /// Time spent in the syscall, 0 for syscalls that never returned.
    pub fn duration_ns(&self) -> u64 {
        self.ts.saturating_sub(self.start_ts)
    }
}

/// Thread id from a `bpf_get_current_pid_tgid()` value (lower 32 bits).
pub const fn tid_from_tgidpid(tgidpid: u64) -> i32 {
    (tgidpid & 0xFFFFFFFF) as i32
}

/// Process id (tgid) from a `bpf_get_current_pid_tgid()` value (upper 32 bits).
pub const fn pid_from_tgidpid(tgidpid: u64) -> i32 {
    (tgidpid >> 32) as i32
}
