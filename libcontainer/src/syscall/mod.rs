//! A narrow interface over the syscalls the isolation primitive needs, so
//! unit tests can substitute a recording double instead of touching the
//! real kernel.

pub mod linux;
pub mod test;

use std::any::Any;
use std::path::Path;

use nix::mount::{MntFlags, MsFlags};

#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error("failed to pivot root")]
    PivotRoot { path: String, err: nix::Error },
    #[error("failed to chroot to {path}: {err}")]
    Chroot { path: String, err: nix::Error },
    #[error("mount failed: target {target} fstype {fstype:?}: {err}")]
    Mount {
        target: String,
        fstype: Option<String>,
        err: nix::Error,
    },
    #[error("umount2 failed for {target}: {err}")]
    Umount { target: String, err: nix::Error },
}

type Result<T> = std::result::Result<T, SyscallError>;

pub trait Syscall {
    fn as_any(&self) -> &dyn Any;
    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<()>;
    fn chroot(&self, path: &Path) -> Result<()>;
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()>;
}

#[derive(Clone, Copy)]
pub enum SyscallType {
    Linux,
    Test,
}

impl Default for SyscallType {
    fn default() -> Self {
        if cfg!(test) {
            SyscallType::Test
        } else {
            SyscallType::Linux
        }
    }
}

impl SyscallType {
    pub fn create_syscall(&self) -> Box<dyn Syscall> {
        match self {
            SyscallType::Linux => Box::new(linux::LinuxSyscall),
            SyscallType::Test => Box::<test::TestHelperSyscall>::default(),
        }
    }
}

pub fn create_syscall() -> Box<dyn Syscall> {
    SyscallType::default().create_syscall()
}
