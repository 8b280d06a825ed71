//! Puts a rootfs directory in place as the child's `/`: remounts it
//! private, bind-mounts it onto itself, pivots with a scratch directory
//! holding the old root, then mounts `/proc` and `/sys` inside.

use std::path::Path;

use nix::mount::{MntFlags, MsFlags};
use nix::unistd::chdir;

use crate::syscall::Syscall;

const PIVOT_SCRATCH_DIR: &str = ".pivot_root";

#[derive(Debug, thiserror::Error)]
pub enum RootfsError {
    #[error("syscall failed: {0}")]
    Syscall(#[from] crate::syscall::SyscallError),
    #[error("failed to create pivot scratch dir {0}: {1}")]
    CreateScratchDir(std::path::PathBuf, std::io::Error),
    #[error("failed to remove pivot scratch dir {0}: {1}")]
    RemoveScratchDir(std::path::PathBuf, std::io::Error),
    #[error("chdir to / failed: {0}")]
    Chdir(nix::Error),
}

type Result<T> = std::result::Result<T, RootfsError>;

/// Puts `rootfs` in place as `/`: remounts the current `/` private so
/// unmount events don't propagate to the host, bind-mounts `rootfs` onto
/// itself to make it a mount point `pivot_root` will accept, pivots with
/// a `.pivot_root` scratch directory holding the old root, then detaches
/// and removes the scratch directory. Falls back to `chroot` when
/// `pivot_root` returns `EPERM`/`EINVAL`, which some user-namespace
/// configurations hit.
pub fn prepare_rootfs(syscall: &dyn Syscall, rootfs: &Path) -> Result<()> {
    // Best-effort: an already-private mount namespace returns EINVAL here,
    // which is fine.
    let _ = syscall.mount(
        None,
        Path::new("/"),
        None,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None,
    );

    syscall.mount(
        Some(rootfs),
        rootfs,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )?;

    match pivot_into(syscall, rootfs) {
        Ok(()) => {}
        Err(RootfsError::Syscall(crate::syscall::SyscallError::PivotRoot { err, .. }))
            if matches!(err, nix::Error::EPERM | nix::Error::EINVAL) =>
        {
            tracing::warn!(?err, "pivot_root unavailable, falling back to chroot");
            syscall.chroot(rootfs)?;
            chdir("/").map_err(RootfsError::Chdir)?;
        }
        Err(err) => return Err(err),
    }

    mount_proc_and_sys(syscall)?;
    Ok(())
}

fn pivot_into(syscall: &dyn Syscall, rootfs: &Path) -> Result<()> {
    let scratch = rootfs.join(PIVOT_SCRATCH_DIR);
    std::fs::create_dir_all(&scratch)
        .map_err(|err| RootfsError::CreateScratchDir(scratch.clone(), err))?;

    syscall.pivot_root(rootfs, &scratch)?;
    chdir("/").map_err(RootfsError::Chdir)?;

    let old_root = Path::new("/").join(PIVOT_SCRATCH_DIR);
    syscall.umount2(&old_root, MntFlags::MNT_DETACH)?;
    std::fs::remove_dir(&old_root)
        .map_err(|err| RootfsError::RemoveScratchDir(old_root.clone(), err))?;
    Ok(())
}

/// Mounts `/proc` and `/sys` inside the new root. `EPERM` is non-fatal
/// here (e.g. nested containers without `CAP_SYS_ADMIN` on `/sys`); any
/// other error is propagated so the caller aborts the child instead of
/// running with a missing `/proc` or `/sys`.
fn mount_proc_and_sys(syscall: &dyn Syscall) -> Result<()> {
    let proc_flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME;
    if let Err(err) = syscall.mount(None, Path::new("/proc"), Some("proc"), proc_flags, None) {
        check_mount_error("/proc", err)?;
    }

    let sys_flags = MsFlags::MS_NOSUID
        | MsFlags::MS_NODEV
        | MsFlags::MS_NOEXEC
        | MsFlags::MS_RELATIME
        | MsFlags::MS_RDONLY;
    if let Err(err) = syscall.mount(None, Path::new("/sys"), Some("sysfs"), sys_flags, None) {
        check_mount_error("/sys", err)?;
    }

    Ok(())
}

fn check_mount_error(target: &str, err: crate::syscall::SyscallError) -> Result<()> {
    if let crate::syscall::SyscallError::Mount { err: nix::Error::EPERM, .. } = err {
        tracing::debug!(target, "mount not permitted, continuing");
        Ok(())
    } else {
        Err(RootfsError::Syscall(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn mount_proc_and_sys_records_both_targets() {
        let syscall = TestHelperSyscall::default();
        mount_proc_and_sys(&syscall).unwrap();
        let mounts = syscall.get_mount_args();
        assert!(mounts.iter().any(|m| m.target == Path::new("/proc")));
        assert!(mounts.iter().any(|m| m.target == Path::new("/sys")));
    }
}
