//! PTY allocation and controlling-terminal setup, grounded on the
//! teacher's `tty.rs` FD-ownership style but simplified: pocket-docker
//! allocates the PTY directly in the runtime process rather than shipping
//! the master fd over a console-socket, since there is no detached
//! create/start split to bridge.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::pty::{openpty, OpenptyResult};
use nix::unistd::{dup2, setsid};

#[derive(Debug, thiserror::Error)]
pub enum TtyError {
    #[error("failed to allocate pty: {0}")]
    OpenPty(nix::Error),
    #[error("failed to setsid: {0}")]
    Setsid(nix::Error),
    #[error("failed to set controlling terminal: {0}")]
    SetCtty(nix::Error),
    #[error("failed to set foreground process group: {0}")]
    SetFpgrp(nix::Error),
    #[error("failed to dup2 fd {0} onto {1}: {2}")]
    Dup2(RawFd, RawFd, nix::Error),
}

type Result<T> = std::result::Result<T, TtyError>;

pub struct Pty {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

pub fn allocate() -> Result<Pty> {
    let OpenptyResult { master, slave } = openpty(None, None).map_err(TtyError::OpenPty)?;
    Ok(Pty { master, slave })
}

/// Makes the calling process a session leader and attaches `slave` as its
/// controlling terminal, then dups it onto stdin/stdout/stderr. Intended
/// to run in the child after the rendezvous latch and before `execve`.
pub fn make_controlling_and_attach(slave: &OwnedFd) -> Result<()> {
    setsid().map_err(TtyError::Setsid)?;
    set_controlling_terminal(slave.as_raw_fd())?;
    for fd in 0..=2 {
        dup2(slave.as_raw_fd(), fd).map_err(|err| TtyError::Dup2(slave.as_raw_fd(), fd, err))?;
    }
    Ok(())
}

fn set_controlling_terminal(fd: RawFd) -> Result<()> {
    let ret = unsafe { libc::ioctl(fd, libc::TIOCSCTTY as _, 0) };
    if ret < 0 {
        return Err(TtyError::SetCtty(nix::Error::last()));
    }
    Ok(())
}

/// Puts `pgid` in `master`'s foreground process group, so a shell running
/// inside the container can correctly restore foreground status after job
/// control.
pub fn set_foreground(master: &OwnedFd, pgid: nix::unistd::Pid) -> Result<()> {
    let pgid_raw: libc::pid_t = pgid.into();
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSPGRP as _, &pgid_raw) };
    if ret < 0 {
        return Err(TtyError::SetFpgrp(nix::Error::last()));
    }
    Ok(())
}
