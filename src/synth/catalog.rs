//! Syscall catalog and filter expressions.

use std::collections::BTreeSet;
use std::str::FromStr;

use syscalls::Sysno;
use tracing::debug;

use crate::error::SessionError;

const FILE_GROUP: &[&str] = &[
    "open", "openat", "openat2", "creat", "close", "stat", "lstat", "fstat", "newfstatat",
    "statx", "access", "faccessat", "faccessat2", "readlink", "readlinkat", "unlink",
    "unlinkat", "rename", "renameat", "renameat2", "mkdir", "mkdirat", "rmdir", "chdir",
    "chmod", "fchmodat", "chown", "fchownat", "truncate", "link", "linkat", "symlink",
    "symlinkat", "execve", "execveat", "getdents64",
];

const DESC_GROUP: &[&str] = &[
    "read", "write", "pread64", "pwrite64", "readv", "writev", "close", "dup", "dup2", "dup3",
    "fcntl", "ioctl", "lseek", "poll", "ppoll", "select", "pselect6", "epoll_wait",
    "epoll_pwait", "epoll_ctl", "fstat", "fsync", "fdatasync", "sendfile", "splice",
];

const PROCESS_GROUP: &[&str] = &[
    "clone", "clone3", "fork", "vfork", "execve", "execveat", "exit", "exit_group", "wait4",
    "waitid", "kill", "tkill", "tgkill",
];

const NETWORK_GROUP: &[&str] = &[
    "socket", "socketpair", "bind", "listen", "accept", "accept4", "connect", "getsockname",
    "getpeername", "sendto", "recvfrom", "sendmsg", "recvmsg", "sendmmsg", "recvmmsg",
    "shutdown", "setsockopt", "getsockopt",
];

const MEMORY_GROUP: &[&str] = &[
    "brk", "mmap", "munmap", "mremap", "mprotect", "madvise", "mlock", "munlock", "msync",
];

/// Syscalls that never return to the caller on success.
const NO_RETURN: &[&str] = &["exit", "exit_group"];

fn group(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "file" => Some(FILE_GROUP),
        "desc" => Some(DESC_GROUP),
        "process" => Some(PROCESS_GROUP),
        "network" | "net" => Some(NETWORK_GROUP),
        "memory" => Some(MEMORY_GROUP),
        _ => None,
    }
}

fn sysno(name: &str) -> Option<u32> {
    Sysno::from_str(name).ok().map(|s| s.id() as u32)
}

/// Name of a syscall number on this architecture.
pub fn syscall_name(nr: i64) -> Option<&'static str> {
    usize::try_from(nr).ok().and_then(Sysno::new).map(|s| s.name())
}

/// Syscalls selected by the filter expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallSet {
    all: bool,
    numbers: BTreeSet<u32>,
}

impl SyscallSet {
    /// Parse filter expressions. Each entry may hold a comma separated list
    /// of syscall names, `%group` names, or `all`.
    pub fn from_filters(filters: &[String]) -> Result<Self, SessionError> {
        let mut set = SyscallSet {
            all: false,
            numbers: BTreeSet::new(),
        };
        let names = filters
            .iter()
            .flat_map(|f| f.split(','))
            .map(str::trim)
            .filter(|n| !n.is_empty());

        for name in names {
            if name == "all" {
                set.all = true;
            } else if let Some(group_name) = name.strip_prefix('%') {
                let members = group(group_name).ok_or_else(|| SessionError::UnknownSyscall {
                    name: name.to_string(),
                })?;
                for member in members {
                    match sysno(member) {
                        Some(nr) => {
                            set.numbers.insert(nr);
                        }
                        None => debug!("{member} does not exist on this architecture"),
                    }
                }
            } else {
                let nr = sysno(name).ok_or_else(|| SessionError::UnknownSyscall {
                    name: name.to_string(),
                })?;
                set.numbers.insert(nr);
            }
        }

        if set.numbers.is_empty() {
            set.all = true;
        }
        Ok(set)
    }

    pub fn traces_all(&self) -> bool {
        self.all
    }

    pub fn contains(&self, nr: u32) -> bool {
        self.all || self.numbers.contains(&nr)
    }

    pub fn numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.numbers.iter().copied()
    }
}

/// Numbers of the syscalls that do not return on this architecture.
pub fn no_return_numbers() -> Vec<u32> {
    NO_RETURN.iter().filter_map(|name| sysno(name)).collect()
}
