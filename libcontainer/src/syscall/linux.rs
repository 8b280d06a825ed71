//! Real syscall implementations backing the pivot_root/mount dance,
//! trimmed to the operations the isolation primitive actually performs.

use std::any::Any;
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chroot, pivot_root};

use super::{Syscall, SyscallError};

type Result<T> = std::result::Result<T, SyscallError>;

#[derive(Clone)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Thin wrapper over the raw syscall; the `.pivot_root` scratch
    /// directory and its cleanup are the caller's concern (see
    /// `rootfs::prepare_rootfs`).
    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<()> {
        pivot_root(new_root, put_old).map_err(|err| SyscallError::PivotRoot {
            path: new_root.display().to_string(),
            err,
        })
    }

    fn chroot(&self, path: &Path) -> Result<()> {
        chroot(path).map_err(|err| SyscallError::Chroot {
            path: path.display().to_string(),
            err,
        })
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data).map_err(|err| SyscallError::Mount {
            target: target.display().to_string(),
            fstype: fstype.map(str::to_string),
            err,
        })
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()> {
        umount2(target, flags).map_err(|err| SyscallError::Umount {
            target: target.display().to_string(),
            err,
        })
    }
}
