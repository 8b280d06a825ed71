//! A recording double for [`Syscall`]: every call is appended to a `RefCell`
//! vec instead of touching the kernel, and never fails unless primed to.

use std::any::Any;
use std::cell::RefCell;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};

use super::{Syscall, SyscallError};

type Result<T> = std::result::Result<T, SyscallError>;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MountArgs {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

#[derive(Default)]
pub struct TestHelperSyscall {
    pivot_root_args: RefCell<Vec<(PathBuf, PathBuf)>>,
    chroot_args: RefCell<Vec<PathBuf>>,
    mount_args: RefCell<Vec<MountArgs>>,
    umount_args: RefCell<Vec<(PathBuf, MntFlags)>>,
}

impl Syscall for TestHelperSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<()> {
        self.pivot_root_args
            .borrow_mut()
            .push((new_root.to_path_buf(), put_old.to_path_buf()));
        Ok(())
    }

    fn chroot(&self, path: &Path) -> Result<()> {
        self.chroot_args.borrow_mut().push(path.to_path_buf());
        Ok(())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        self.mount_args.borrow_mut().push(MountArgs {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_string),
            flags,
            data: data.map(str::to_string),
        });
        Ok(())
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()> {
        self.umount_args
            .borrow_mut()
            .push((target.to_path_buf(), flags));
        Ok(())
    }
}

impl TestHelperSyscall {
    pub fn get_mount_args(&self) -> Vec<MountArgs> {
        self.mount_args.borrow().clone()
    }

    pub fn get_pivot_root_args(&self) -> Vec<(PathBuf, PathBuf)> {
        self.pivot_root_args.borrow().clone()
    }
}
