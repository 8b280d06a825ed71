//! The isolation primitive: `clone_and_run` forks a child directly into
//! fresh namespaces, rendezvous-blocks it on a pipe so the supervisor can
//! finish host-side setup first, then lets it set up its stdio, pivot
//! into the rootfs, and `execve` the target command.

pub mod fork;

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use nix::unistd::{dup2, read, Gid, Pid, Uid};

use crate::pipe::{Pipe, PipeReader, PipeWriter};
use crate::rootfs;
use crate::syscall::linux::LinuxSyscall;
use crate::tty::{self, Pty};

const SEARCH_PATH: [&str; 3] = ["/bin", "/usr/bin", "/usr/local/bin"];
/// Test hook: disables rootfs/proc/sysfs setup in the child so unit
/// and CI sandboxes without `CAP_SYS_ADMIN` can still exercise the
/// rendezvous/exec path.
const SKIP_SETUP_ENV: &str = "SKIP_SETUP";

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to create pipe: {0}")]
    Pipe(#[from] crate::pipe::PipeError),
    #[error("failed to allocate pty: {0}")]
    Pty(#[from] crate::tty::TtyError),
    #[error("clone failed: {0}")]
    Clone(#[from] fork::CloneError),
    #[error("failed to write {path}: {err}")]
    WriteProcFile { path: PathBuf, err: std::io::Error },
    #[error("executable {0:?} not found in rootfs")]
    ExecutableNotFound(String),
}

type Result<T> = std::result::Result<T, ProcessError>;

/// The parent-side handle to the child's stdio.
pub enum ChildIo {
    Pty { master: OwnedFd },
    Pipes {
        stdin_writer: PipeWriter,
        stdout_reader: PipeReader,
    },
}

pub struct ClonedChild {
    pub pid: Pid,
    pub io: ChildIo,
    rendezvous_writer: Option<PipeWriter>,
}

impl ClonedChild {
    /// Closes the rendezvous pipe's write end, unblocking the child's
    /// `read(rp, 1)` so it proceeds to exec. Idempotent.
    pub fn release(&mut self) {
        self.rendezvous_writer.take();
    }
}

/// Writes `/proc/<pid>/{setgroups,gid_map,uid_map}` in the mandated order:
/// the kernel refuses `uid_map`/`gid_map` for an unprivileged
/// user-namespace creator unless `setgroups` is denied first.
pub fn write_id_mappings(pid: Pid, host_uid: Uid, host_gid: Gid) -> Result<()> {
    write_proc_file(pid, "setgroups", "deny")?;
    write_proc_file(pid, "gid_map", &format!("0 {host_gid} 1"))?;
    write_proc_file(pid, "uid_map", &format!("0 {host_uid} 1"))?;
    Ok(())
}

fn write_proc_file(pid: Pid, name: &str, contents: &str) -> Result<()> {
    let path = PathBuf::from(format!("/proc/{pid}/{name}"));
    std::fs::write(&path, contents).map_err(|err| ProcessError::WriteProcFile { path, err })
}

/// Clones a child into fresh UTS/PID/mount/network/user namespaces,
/// leaving it blocked on the rendezvous pipe until the caller calls
/// `ClonedChild::release`.
pub fn clone_and_run(
    cmd: &str,
    args: &[String],
    rootfs: &Path,
    interactive: bool,
    with_tty: bool,
) -> Result<ClonedChild> {
    let rendezvous = Pipe::new()?;
    let (rv_reader, rv_writer) = rendezvous.split();

    let (parent_io, child_io) = if with_tty {
        let pty = tty::allocate()?;
        (
            ChildIo::Pty { master: pty.master },
            ChildSide::Pty { slave: pty.slave },
        )
    } else {
        let stdin_pipe = Pipe::new()?;
        let stdout_pipe = Pipe::new()?;
        let (stdin_r, stdin_w) = stdin_pipe.split();
        let (stdout_r, stdout_w) = stdout_pipe.split();
        (
            ChildIo::Pipes {
                stdin_writer: stdin_w,
                stdout_reader: stdout_r,
            },
            ChildSide::Pipes {
                stdin_reader: stdin_r,
                stdout_writer: stdout_w,
            },
        )
    };

    let rv_read_fd = rv_reader.into_fd();
    let rv_write_fd = rv_writer.as_raw_fd();
    let cmd = cmd.to_string();
    let args = args.to_vec();
    let rootfs = rootfs.to_path_buf();

    let flags = CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWUSER;

    let cb: fork::CloneCb = Box::new(move || match child_main(
        rv_read_fd,
        rv_write_fd,
        &child_io,
        interactive,
        with_tty,
        &rootfs,
        &cmd,
        &args,
    ) {
        Ok(()) => 0,
        Err(msg) => {
            let _ = nix::unistd::write(2, msg.as_bytes());
            127
        }
    });

    let pid = fork::clone(cb, flags)?;

    // The child got its own fd-table copy of both pipe ends at clone time
    // (no CLONE_FILES); the parent only needs the write end to release the
    // latch, so its copy of the read end is closed here.
    unsafe { libc::close(rv_read_fd) };

    Ok(ClonedChild {
        pid,
        io: parent_io,
        rendezvous_writer: Some(rv_writer),
    })
}

enum ChildSide {
    Pty { slave: OwnedFd },
    Pipes {
        stdin_reader: PipeReader,
        stdout_writer: PipeWriter,
    },
}

/// Runs entirely inside the cloned child: blocks on the rendezvous latch,
/// wires stdio, pivots into the rootfs, and execs the target command.
/// Returns a diagnostic string on any failure so the caller can write it
/// to fd 2 before exiting non-zero.
fn child_main(
    rv_read_fd: RawFd,
    rv_write_fd: RawFd,
    io: &ChildSide,
    interactive: bool,
    with_tty: bool,
    rootfs: &Path,
    cmd: &str,
    args: &[String],
) -> std::result::Result<(), String> {
    // This process inherited its own fd-table copy of the write end at
    // clone time; only the parent writes (closes) it to release the latch,
    // so the child's copy is closed first or the read below never sees EOF.
    unsafe { libc::close(rv_write_fd) };

    let mut latch = [0u8; 1];
    loop {
        match read(rv_read_fd, &mut latch) {
            Ok(_) => break,
            Err(nix::Error::EINTR) => continue,
            Err(err) => return Err(format!("rendezvous read failed: {err}\n")),
        }
    }
    unsafe { libc::close(rv_read_fd) };

    match io {
        ChildSide::Pty { slave } => {
            tty::make_controlling_and_attach(slave).map_err(|err| format!("pty setup failed: {err}\n"))?;
        }
        ChildSide::Pipes {
            stdin_reader,
            stdout_writer,
        } => {
            if interactive {
                dup2(stdin_reader.as_raw_fd(), 0).map_err(|err| format!("dup2 stdin failed: {err}\n"))?;
            } else {
                let devnull = nix::fcntl::open("/dev/null", nix::fcntl::OFlag::O_RDONLY, Mode::empty())
                    .map_err(|err| format!("open /dev/null failed: {err}\n"))?;
                dup2(devnull, 0).map_err(|err| format!("dup2 stdin failed: {err}\n"))?;
                unsafe { libc::close(devnull) };
            }
            dup2(stdout_writer.as_raw_fd(), 1).map_err(|err| format!("dup2 stdout failed: {err}\n"))?;
            dup2(stdout_writer.as_raw_fd(), 2).map_err(|err| format!("dup2 stderr failed: {err}\n"))?;
        }
    }

    if std::env::var(SKIP_SETUP_ENV).as_deref() != Ok("1") {
        let syscall = LinuxSyscall;
        rootfs::prepare_rootfs(&syscall, rootfs).map_err(|err| format!("rootfs setup failed: {err}\n"))?;
    }

    let resolved = resolve_executable(cmd, rootfs).ok_or_else(|| format!("{cmd}: not found\n"))?;
    let _ = with_tty;

    let c_path = CString::new(resolved.as_os_str().as_encoded_bytes()).map_err(|err| err.to_string())?;
    let mut argv: Vec<CString> = vec![c_path.clone()];
    for arg in args {
        argv.push(CString::new(arg.as_bytes()).map_err(|err| err.to_string())?);
    }
    let envp: Vec<CString> = std::env::vars()
        .map(|(k, v)| CString::new(format!("{k}={v}")).unwrap_or_else(|_| CString::new("").unwrap()))
        .collect();

    match nix::unistd::execve(&c_path, &argv, &envp) {
        Ok(_) => unreachable!("execve only returns on error"),
        Err(err) => Err(format!("execve {cmd} failed: {err}\n")),
    }
}

/// Resolves `cmd` against the new root: absolute paths and paths
/// containing `/` are used as-is (relative to the new `/`); a bare name
/// is searched for in `SEARCH_PATH`.
fn resolve_executable(cmd: &str, rootfs: &Path) -> Option<PathBuf> {
    if cmd.contains('/') {
        return Some(PathBuf::from(cmd));
    }
    for dir in SEARCH_PATH {
        let candidate = Path::new(dir).join(cmd);
        let on_disk = rootfs.join(candidate.strip_prefix("/").unwrap_or(&candidate));
        if on_disk.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolve_executable_passes_through_paths_with_slash() {
        let tmp = TempDir::new().unwrap();
        let resolved = resolve_executable("/bin/sh", tmp.path());
        assert_eq!(resolved, Some(PathBuf::from("/bin/sh")));
    }

    #[test]
    fn resolve_executable_searches_fixed_path() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("usr/bin")).unwrap();
        std::fs::write(tmp.path().join("usr/bin/busybox"), b"").unwrap();

        let resolved = resolve_executable("busybox", tmp.path());
        assert_eq!(resolved, Some(PathBuf::from("/usr/bin/busybox")));
    }

    #[test]
    fn resolve_executable_returns_none_when_missing() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(resolve_executable("ghost", tmp.path()), None);
    }
}
