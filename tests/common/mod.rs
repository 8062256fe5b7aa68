//! Common test utilities for strace-ebpf integration tests.
//!
//! Sessions are driven through a mock instrumentation backend whose readers
//! are eventfds fed from the test, and a dispatcher that records every event.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use strace_ebpf::instrument::{Attachment, ConsumeError, EventReader, InstrumentationBackend};
use strace_ebpf::output::{EventDispatcher, SyscallEvent};

/// Ordered record of what the backend was asked to do.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Producer side of a mock reader.
#[derive(Clone)]
pub struct Feed {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    eventfd: Arc<OwnedFd>,
}

impl Feed {
    pub fn new() -> Self {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        assert!(fd >= 0, "eventfd failed: {}", io::Error::last_os_error());
        Self {
            queue: Arc::default(),
            eventfd: Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }),
        }
    }

    pub fn push(&self, data: Vec<u8>) {
        self.queue.lock().unwrap().push_back(data);
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Push a heartbeat record every `interval` until the returned guard is
    /// dropped. Keeps the loop waking up when no process watch fires.
    pub fn heartbeat(&self, interval: Duration) -> Heartbeat {
        let stop = Arc::new(AtomicBool::new(false));
        let feed = self.clone();
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                feed.push(event_bytes(1));
                thread::sleep(interval);
            }
        });
        Heartbeat {
            stop,
            handle: Some(handle),
        }
    }
}

pub struct Heartbeat {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A well-formed event record for syscall `nr`.
pub fn event_bytes(nr: i64) -> Vec<u8> {
    let event = SyscallEvent {
        ts: 2_000,
        start_ts: 1_000,
        pid_tid: (7u64 << 32) | 7,
        sc_id: nr,
        ..Default::default()
    };
    unsafe { plain::as_bytes(&event) }.to_vec()
}

pub struct MockReader {
    name: String,
    feed: Feed,
    log: CallLog,
}

impl EventReader for MockReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.feed.eventfd.as_raw_fd()
    }

    fn consume(
        &self,
        dispatch: &mut dyn FnMut(&[u8]) -> io::Result<()>,
    ) -> Result<usize, ConsumeError> {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(
                self.feed.eventfd.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        let mut count = 0;
        loop {
            let Some(record) = self.feed.queue.lock().unwrap().pop_front() else {
                break;
            };
            dispatch(&record).map_err(ConsumeError::Dispatch)?;
            count += 1;
        }
        Ok(count)
    }
}

impl Drop for MockReader {
    fn drop(&mut self) {
        self.log.lock().unwrap().push(format!("close {}", self.name));
    }
}

pub struct MockProbe {
    name: String,
    log: CallLog,
}

impl Drop for MockProbe {
    fn drop(&mut self) {
        self.log.lock().unwrap().push(format!("detach {}", self.name));
    }
}

/// Run state of a process as reported by `/proc/<pid>/stat`.
pub fn process_state(pid: i32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let end = stat.rfind(')')?;
    stat[end + 1..].trim_start().chars().next()
}

pub struct MockBackend {
    pub probes: usize,
    pub failed: usize,
    pub fail_compile: bool,
    pub feeds: Vec<Feed>,
    pub log: CallLog,
    /// Source handed to `compile`.
    pub source: Arc<Mutex<Option<String>>>,
    restricted: Option<i32>,
}

impl MockBackend {
    pub fn new(probes: usize, feeds: &[Feed]) -> Self {
        Self {
            probes,
            failed: 0,
            fail_compile: false,
            feeds: feeds.to_vec(),
            log: Arc::default(),
            source: Arc::default(),
            restricted: None,
        }
    }
}

impl InstrumentationBackend for MockBackend {
    type Program = ();
    type Probe = MockProbe;
    type Reader = MockReader;

    fn compile(&mut self, source: &str) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("compile".to_string());
        *self.source.lock().unwrap() = Some(source.to_string());
        if self.fail_compile {
            anyhow::bail!("error: use of undeclared identifier 'x'");
        }
        Ok(())
    }

    fn restrict_to(&mut self, _program: &mut (), pid: i32) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("restrict {pid}"));
        self.restricted = Some(pid);
        Ok(())
    }

    fn attach_all(&mut self, _program: &mut ()) -> anyhow::Result<Attachment<MockProbe, MockReader>> {
        // A held child must still be stopped while probes are attached
        let state = self
            .restricted
            .and_then(process_state)
            .map(|s| format!(" (target {s})"))
            .unwrap_or_default();
        self.log.lock().unwrap().push(format!("attach{state}"));

        let probes = (0..self.probes)
            .map(|i| {
                let name = format!("probe{i}");
                (
                    name.clone(),
                    MockProbe {
                        name,
                        log: self.log.clone(),
                    },
                )
            })
            .collect();
        let readers = self
            .feeds
            .iter()
            .enumerate()
            .map(|(i, feed)| MockReader {
                name: format!("events{i}"),
                feed: feed.clone(),
                log: self.log.clone(),
            })
            .collect();
        let failed = (0..self.failed)
            .map(|i| (format!("missing{i}"), "No such file or directory".to_string()))
            .collect();
        Ok(Attachment {
            probes,
            readers,
            failed,
        })
    }
}

/// Dispatcher that keeps every record and can be told to fail.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub header: Option<Vec<String>>,
    pub events: Vec<Vec<u8>>,
    /// Number of `on_event` calls, failed ones included.
    pub attempts: usize,
    /// Fail the n-th `on_event` call (1-based) and every call after it.
    pub fail_on: Option<usize>,
    pub fail_header: bool,
    pub flushes: usize,
}

impl RecordingDispatcher {
    pub fn failing_on(n: usize) -> Self {
        Self {
            fail_on: Some(n),
            ..Default::default()
        }
    }
}

impl EventDispatcher for RecordingDispatcher {
    fn print_header(&mut self, argv: &[String]) -> io::Result<()> {
        if self.fail_header {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.header = Some(argv.to_vec());
        Ok(())
    }

    fn on_event(&mut self, data: &[u8]) -> io::Result<()> {
        self.attempts += 1;
        if self.fail_on.is_some_and(|n| self.attempts >= n) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.events.push(data.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
