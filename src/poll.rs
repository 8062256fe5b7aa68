//! The single blocking wait of the session loop.
//!
//! An epoll set holds every event reader fd plus wakeup-only sources: the
//! abort eventfd and, depending on the mode, a child watch.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::debug;

/// What woke the wait up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    /// The reader at this index has data.
    Reader(usize),
    /// The abort eventfd was signalled.
    Wake,
    /// A watched process changed state.
    Child,
}

const TOKEN_WAKE: u64 = u64::MAX;
const TOKEN_CHILD: u64 = u64::MAX - 1;

fn decode(token: u64) -> Ready {
    match token {
        TOKEN_WAKE => Ready::Wake,
        TOKEN_CHILD => Ready::Child,
        idx => Ready::Reader(idx as usize),
    }
}

/// Non-blocking eventfd used to interrupt the blocking wait.
#[derive(Debug)]
pub struct ShutdownSignal {
    eventfd: OwnedFd,
}

impl ShutdownSignal {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            eventfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Async-signal-safe: a single `write(2)`.
    pub fn signal(&self) {
        let val: u64 = 1;
        let _ = unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
    }

    /// Reset the counter so the fd stops polling readable.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        let _ = unsafe {
            libc::read(
                self.eventfd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            )
        };
    }

    pub fn fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }
}

/// Wakeup source for process-lifecycle changes.
pub enum ChildWatch {
    /// pidfd of a single process; readable once it exits.
    PidFd(OwnedFd),
    /// SIGCHLD delivered through a signalfd; requires SIGCHLD to be blocked.
    SigChld(SignalFd),
}

impl ChildWatch {
    /// Watch one process through a pidfd. `None` when the kernel has no
    /// `pidfd_open`; the loop then relies on event traffic to wake up.
    pub fn pid(pid: i32) -> Option<Self> {
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if fd < 0 {
            debug!(
                "pidfd_open({pid}) failed: {}",
                io::Error::last_os_error()
            );
            return None;
        }
        Some(ChildWatch::PidFd(unsafe { OwnedFd::from_raw_fd(fd as RawFd) }))
    }

    /// Watch every child through SIGCHLD. Blocks SIGCHLD in the calling
    /// thread; [`block_child_signal`] must already have run in `main` for
    /// the mask to cover the whole process.
    pub fn children() -> Option<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        if let Err(e) = mask.thread_block() {
            debug!("cannot block SIGCHLD: {e}");
            return None;
        }
        match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
            Ok(fd) => Some(ChildWatch::SigChld(fd)),
            Err(e) => {
                debug!("signalfd for SIGCHLD failed: {e}");
                None
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            ChildWatch::PidFd(fd) => fd.as_raw_fd(),
            ChildWatch::SigChld(sfd) => sfd.as_fd().as_raw_fd(),
        }
    }

    /// Consume pending notifications. A pidfd stays readable, which is fine:
    /// the session stops as soon as the exit is reaped.
    pub fn drain(&mut self) {
        if let ChildWatch::SigChld(sfd) = self {
            while let Ok(Some(_)) = sfd.read_signal() {}
        }
    }
}

/// Block SIGCHLD for the calling thread and every thread it starts later.
///
/// Called first thing in `main` so the signalfd used in follow-descendants
/// mode sees every SIGCHLD.
pub fn block_child_signal() -> nix::Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block()
}

/// epoll set over the readers and wakeup sources.
pub struct Poller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: Vec::new(),
        })
    }

    fn add(&mut self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) }
            < 0
        {
            return Err(io::Error::last_os_error());
        }
        self.events.push(libc::epoll_event { events: 0, u64: 0 });
        Ok(())
    }

    pub fn add_reader(&mut self, idx: usize, fd: RawFd) -> io::Result<()> {
        self.add(fd, idx as u64)
    }

    pub fn add_wake(&mut self, signal: &ShutdownSignal) -> io::Result<()> {
        self.add(signal.fd(), TOKEN_WAKE)
    }

    pub fn add_child_watch(&mut self, watch: &ChildWatch) -> io::Result<()> {
        self.add(watch.raw_fd(), TOKEN_CHILD)
    }

    /// Block until at least one source is ready or a signal interrupts the
    /// wait. An interrupted wait returns an empty set.
    pub fn wait(&mut self) -> io::Result<Vec<Ready>> {
        if self.events.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "nothing registered to poll",
            ));
        }
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                -1,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let mut ready: Vec<Ready> = self
            .events
            .iter()
            .take(n as usize)
            .map(|ev| decode(ev.u64))
            .collect();
        // Readers in registration order keep dispatch deterministic
        ready.sort_by_key(|r| match r {
            Ready::Reader(idx) => *idx as u64,
            Ready::Child => TOKEN_CHILD,
            Ready::Wake => TOKEN_WAKE,
        });
        Ok(ready)
    }
}

impl AsFd for Poller {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.epoll_fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_interrupts_wait() {
        let signal = ShutdownSignal::new().unwrap();
        let mut poller = Poller::new().unwrap();
        poller.add_wake(&signal).unwrap();
        signal.signal();
        assert_eq!(poller.wait().unwrap(), vec![Ready::Wake]);
        signal.drain();
    }

    #[test]
    fn test_reader_tokens_are_sorted() {
        let a = ShutdownSignal::new().unwrap();
        let b = ShutdownSignal::new().unwrap();
        let mut poller = Poller::new().unwrap();
        poller.add_reader(1, b.fd()).unwrap();
        poller.add_reader(0, a.fd()).unwrap();
        a.signal();
        b.signal();
        assert_eq!(
            poller.wait().unwrap(),
            vec![Ready::Reader(0), Ready::Reader(1)]
        );
    }

    #[test]
    fn test_empty_poller_is_an_error() {
        let mut poller = Poller::new().unwrap();
        assert!(poller.wait().is_err());
    }

    #[test]
    fn test_pidfd_readable_after_exit() {
        let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
        let pid = child.id() as i32;
        let Some(watch) = ChildWatch::pid(pid) else {
            // Kernel without pidfd_open
            child.wait().unwrap();
            return;
        };
        let mut poller = Poller::new().unwrap();
        poller.add_child_watch(&watch).unwrap();
        assert_eq!(poller.wait().unwrap(), vec![Ready::Child]);
        child.wait().unwrap();
    }
}
