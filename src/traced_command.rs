//! Fork-stop-exec: start a command so that it can be traced from its very
//! first syscall.
//!
//! [`spawn_held_child`] forks a child that stops itself with `SIGSTOP` right
//! before `execv`. The tracer restricts and attaches its probes while the
//! child is held, then continues it and calls [`HeldChild::wait_for_exec`].

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, pipe2, ForkResult};
use tracing::debug;

/// A forked child stopped right before exec.
pub struct HeldChild {
    /// Also the tgid the BPF filter matches on.
    pub pid: i32,
    /// Close-on-exec status pipe: EOF once exec succeeded, an errno if not.
    exec_status: Option<OwnedFd>,
}

impl HeldChild {
    /// Block until the continued child has exec'd. A child that dies before
    /// exec also reads as EOF; the reaper reports that one.
    pub fn wait_for_exec(&mut self) -> Result<()> {
        let Some(fd) = self.exec_status.take() else {
            return Ok(());
        };
        match read_exec_errno(File::from(fd)).context("Failed to read exec status")? {
            None => Ok(()),
            Some(errno) => Err(anyhow!(io::Error::from_raw_os_error(errno)))
                .with_context(|| format!("PID {} could not exec", self.pid)),
        }
    }
}

fn read_exec_errno(mut pipe: File) -> io::Result<Option<i32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match pipe.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        0 => None,
        4 => Some(i32::from_ne_bytes(buf)),
        _ => Some(libc::EIO),
    })
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve `name` the way `execvp` would, but before fork.
fn find_executable(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        let metadata = path
            .metadata()
            .with_context(|| format!("{name}: no such file"))?;
        if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
            bail!("{name}: not an executable file");
        }
        return Ok(path);
    }

    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| anyhow!("{name}: command not found in PATH"))
}

/// Everything `execv` needs, allocated before fork.
struct ExecImage {
    path: CString,
    _args: Vec<CString>,
    argv: Vec<*const libc::c_char>,
}

impl ExecImage {
    fn prepare(command: &[String]) -> Result<Self> {
        let Some(program) = command.first() else {
            bail!("empty command");
        };
        let path = find_executable(program)?;
        debug!("Resolved {program} to {}", path.display());

        let path = CString::new(path.as_os_str().as_bytes())
            .with_context(|| format!("{program}: path contains a NUL byte"))?;
        let args = command
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .context("argument contains a NUL byte")?;
        let argv = args
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Ok(Self {
            path,
            _args: args,
            argv,
        })
    }
}

/// Child side of the fork. Only async-signal-safe calls; never returns.
unsafe fn exec_when_continued(image: &ExecImage, status: RawFd, tracer: libc::pid_t) -> ! {
    // Die with the tracer, and give up if it is already gone
    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
    if libc::getppid() != tracer {
        libc::_exit(1);
    }

    // SIGCHLD is blocked in the tracer; the command starts with an empty mask
    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());

    libc::raise(libc::SIGSTOP);
    libc::execv(image.path.as_ptr(), image.argv.as_ptr());

    let errno = (*libc::__errno_location()).to_ne_bytes();
    libc::write(status, errno.as_ptr().cast(), errno.len());
    libc::_exit(127);
}

/// Fork a child that stops itself before exec-ing `command`.
///
/// Returns only once the child has been seen stopped, so nothing of the
/// target program runs before the caller sends `SIGCONT`.
pub fn spawn_held_child(command: &[String]) -> Result<HeldChild> {
    let image = ExecImage::prepare(command)?;
    let (status_read, status_write) =
        pipe2(OFlag::O_CLOEXEC).context("Failed to create exec status pipe")?;
    let tracer = getpid().as_raw();

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => unsafe {
            drop(status_read);
            exec_when_continued(&image, status_write.as_raw_fd(), tracer)
        },
        ForkResult::Parent { child } => {
            drop(status_write);
            match waitpid(child, Some(WaitPidFlag::WUNTRACED)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => Ok(HeldChild {
                    pid: child.as_raw(),
                    exec_status: Some(status_read),
                }),
                Ok(status) => bail!("PID {child} did not stop before exec: {status:?}"),
                Err(e) => {
                    Err(e).with_context(|| format!("Failed to wait for PID {child} to stop"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, Write};

    #[test]
    fn test_find_absolute_path() {
        assert_eq!(find_executable("/bin/sh").unwrap(), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_find_in_path() {
        let path = find_executable("sh").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn test_find_missing_command() {
        let err = find_executable("definitely-not-a-command-xyz").unwrap_err();
        assert!(err.to_string().contains("not found in PATH"));
    }

    #[test]
    fn test_find_non_executable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = find_executable(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("not an executable"));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(spawn_held_child(&[]).is_err());
    }

    #[test]
    fn test_exec_errno_from_pipe() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&libc::ENOENT.to_ne_bytes()).unwrap();
        file.rewind().unwrap();
        assert_eq!(read_exec_errno(file).unwrap(), Some(libc::ENOENT));

        let empty = tempfile::tempfile().unwrap();
        assert_eq!(read_exec_errno(empty).unwrap(), None);
    }
}
