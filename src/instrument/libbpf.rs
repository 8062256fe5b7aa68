//! libbpf-rs backend: clang for the generated C, libbpf for load/attach.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::OsStr;
use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::Command;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use libbpf_rs::{Link, MapCore, MapFlags, MapType, Object, ObjectBuilder, RingBufferBuilder};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::{Attachment, ConsumeError, EventReader, InstrumentationBackend};
use crate::config::Config;

/// Name of the map the pid filter reads from.
pub const TARGET_PIDS_MAP: &str = "target_pids";

/// Memory lock limit for BPF maps on kernels without memcg accounting (128 MiB)
const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;

const BPF_JIT_SYSCTL: &str = "/proc/sys/net/core/bpf_jit_enable";

/// Raise `RLIMIT_MEMLOCK` so map creation does not fail on older kernels.
pub fn bump_memlock_rlimit() {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        warn!(
            "Failed to increase RLIMIT_MEMLOCK to {} MiB: {}",
            MEMLOCK_RLIMIT_BYTES >> 20,
            io::Error::last_os_error()
        );
    }
}

/// Report whether the BPF JIT compiler is enabled.
pub fn check_jit_status() {
    match std::fs::read_to_string(BPF_JIT_SYSCTL) {
        Ok(value) => match value.trim() {
            "0" => warn!("BPF JIT is disabled, tracing will be slow (see {BPF_JIT_SYSCTL})"),
            other => debug!("BPF JIT status: {other}"),
        },
        Err(e) => debug!("Cannot read {BPF_JIT_SYSCTL}: {e}"),
    }
}

fn target_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x86",
        "aarch64" => "arm64",
        "powerpc64" => "powerpc",
        "s390x" => "s390",
        "riscv64" => "riscv",
        other => other,
    }
}

/// A loaded BPF object and the scratch directory its source was built in.
pub struct LoadedProgram {
    object: Object,
    _build_dir: TempDir,
}

/// A ring buffer map drained through a staging queue, so that dispatch
/// happens outside the libbpf callback and can stop at the first failure.
pub struct RingReader {
    name: String,
    ring: libbpf_rs::RingBuffer<'static>,
    staged: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl EventReader for RingReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.ring.epoll_fd()
    }

    fn consume(
        &self,
        dispatch: &mut dyn FnMut(&[u8]) -> io::Result<()>,
    ) -> Result<usize, ConsumeError> {
        self.ring
            .consume()
            .map_err(|e| ConsumeError::Reader(anyhow::Error::from(e).context(self.name.clone())))?;

        let mut staged = self.staged.borrow_mut();
        let mut count = 0;
        while let Some(record) = staged.pop_front() {
            if let Err(e) = dispatch(&record) {
                staged.clear();
                return Err(ConsumeError::Dispatch(e));
            }
            count += 1;
        }
        Ok(count)
    }
}

pub struct LibbpfBackend {
    clang: PathBuf,
    include_dirs: Vec<PathBuf>,
    ring_bytes: u32,
}

impl LibbpfBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            clang: config.clang.clone(),
            include_dirs: config.include_dirs.clone(),
            ring_bytes: config.ring_bytes(),
        }
    }

    fn build_object(&self, source: &str, dir: &TempDir) -> Result<PathBuf> {
        let src_path = dir.path().join("strace.bpf.c");
        let obj_path = dir.path().join("strace.bpf.o");
        std::fs::write(&src_path, source)
            .with_context(|| format!("Failed to write {}", src_path.display()))?;

        let mut cmd = Command::new(&self.clang);
        cmd.args(["-g", "-O2", "-target", "bpf"])
            .arg(format!("-D__TARGET_ARCH_{}", target_arch()))
            .arg("-idirafter")
            .arg(format!("/usr/include/{}-linux-gnu", std::env::consts::ARCH));
        for dir in &self.include_dirs {
            cmd.arg(format!("-I{}", dir.display()));
        }
        cmd.arg("-c").arg(&src_path).arg("-o").arg(&obj_path);
        debug!("Running {:?}", cmd);

        let output = cmd
            .output()
            .with_context(|| format!("Failed to execute {}", self.clang.display()))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.clang.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(obj_path)
    }
}

impl InstrumentationBackend for LibbpfBackend {
    type Program = LoadedProgram;
    type Probe = Link;
    type Reader = RingReader;

    fn compile(&mut self, source: &str) -> Result<LoadedProgram> {
        let build_dir = tempfile::Builder::new()
            .prefix("strace-ebpf")
            .tempdir()
            .context("Failed to create build directory")?;
        let obj_path = self.build_object(source, &build_dir)?;

        let mut open_object = ObjectBuilder::default()
            .open_file(&obj_path)
            .context("Failed to open BPF object")?;
        for mut map in open_object.maps_mut() {
            if map.map_type() == MapType::RingBuf {
                map.set_max_entries(self.ring_bytes)
                    .context("Failed to size ring buffer")?;
            }
        }
        let object = open_object
            .load()
            .context("BPF program was rejected by the kernel")?;

        Ok(LoadedProgram {
            object,
            _build_dir: build_dir,
        })
    }

    fn restrict_to(&mut self, program: &mut LoadedProgram, pid: i32) -> Result<()> {
        let map = program
            .object
            .maps()
            .find(|m| m.name() == OsStr::new(TARGET_PIDS_MAP))
            .with_context(|| format!("{TARGET_PIDS_MAP} map not found in BPF object"))?;
        map.update(&(pid as u32).to_ne_bytes(), &[1u8], MapFlags::ANY)
            .with_context(|| format!("Failed to add PID {pid} to {TARGET_PIDS_MAP}"))?;
        Ok(())
    }

    fn attach_all(
        &mut self,
        program: &mut LoadedProgram,
    ) -> Result<Attachment<Link, RingReader>> {
        let mut probes = Vec::new();
        let mut failed = Vec::new();
        for prog in program.object.progs_mut() {
            let name = prog.name().to_string_lossy().to_string();
            match prog.attach() {
                Ok(link) => {
                    debug!("Attached {name}");
                    probes.push((name, link));
                }
                Err(e) => failed.push((name, e.to_string())),
            }
        }

        let mut readers = Vec::new();
        if !probes.is_empty() {
            for map in program.object.maps() {
                if map.map_type() != MapType::RingBuf {
                    continue;
                }
                let name = map.name().to_string_lossy().to_string();
                let staged: Rc<RefCell<VecDeque<Vec<u8>>>> = Rc::default();
                let sink = staged.clone();
                let mut builder = RingBufferBuilder::new();
                builder
                    .add(&map, move |data: &[u8]| {
                        sink.borrow_mut().push_back(data.to_vec());
                        0
                    })
                    .with_context(|| format!("Failed to add ring buffer {name}"))?;
                let ring = builder.build()?;
                readers.push(RingReader { name, ring, staged });
            }
        }

        Ok(Attachment {
            probes,
            readers,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_arch_names() {
        let arch = target_arch();
        assert!(!arch.is_empty());
        if cfg!(target_arch = "x86_64") {
            assert_eq!(arch, "x86");
        }
    }

    #[test]
    fn test_backend_takes_ring_size_from_config() {
        let config = Config {
            ring_pages: 3,
            ..Default::default()
        };
        let backend = LibbpfBackend::new(&config);
        assert_eq!(backend.ring_bytes, config.ring_bytes());
        assert_eq!(backend.clang, PathBuf::from("clang"));
    }

    #[test]
    fn test_missing_compiler_is_a_compile_error() {
        let config = Config {
            clang: PathBuf::from("/nonexistent/clang"),
            ..Default::default()
        };
        let mut backend = LibbpfBackend::new(&config);
        let err = backend.compile("int x;").err().unwrap();
        assert!(format!("{err:#}").contains("/nonexistent/clang"));
    }
}
