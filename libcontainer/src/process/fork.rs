//! `clone(2)`-based process creation. Using the raw syscall instead of
//! `nix::sched::clone` gives direct control over entering namespaces in
//! one step rather than unshare-then-fork, and lets us size and guard the
//! child's stack ourselves.

use std::mem;
use std::ptr;

use libc::{c_int, c_void};
use nix::errno::Errno;
use nix::sched;
use nix::sys::mman;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

pub type CloneCb = Box<dyn FnMut() -> isize>;

#[derive(Debug, thiserror::Error)]
pub enum CloneError {
    #[error("failed to read RLIMIT_STACK: {0}")]
    GetRlimit(Errno),
    #[error("failed to mmap child stack: {0}")]
    Mmap(Errno),
    #[error("failed to mprotect guard page: {0}")]
    Mprotect(Errno),
    #[error("clone(2) failed: {0}")]
    Clone(Errno),
}

type Result<T> = std::result::Result<T, CloneError>;

/// Creates a new process entering the namespaces in `clone_flags` directly
/// (plus `SIGCHLD`, to mimic `fork`'s wait semantics), running `cb` as its
/// entry point. The child's stack is mmap'd by hand: `nix::sched::clone`'s
/// safe wrapper doesn't let us use a raw pointer for it, and we don't want
/// Rust managing that memory since `execve` (or process exit) resets it.
pub fn clone(mut cb: CloneCb, clone_flags: sched::CloneFlags) -> Result<Pid> {
    extern "C" fn callback(data: *mut CloneCb) -> c_int {
        let cb: &mut CloneCb = unsafe { &mut *data };
        (*cb)() as c_int
    }

    let page_size: usize = unsafe {
        match libc::sysconf(libc::_SC_PAGE_SIZE) {
            -1 => 4 * 1024,
            x => x as usize,
        }
    };

    let mut rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe {
        Errno::result(libc::getrlimit(libc::RLIMIT_STACK, &mut rlimit)).map_err(CloneError::GetRlimit)?;
    }
    let default_stack_size = rlimit.rlim_cur as usize;

    let child_stack = unsafe {
        mman::mmap(
            ptr::null_mut(),
            default_stack_size,
            mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
            mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_ANONYMOUS | mman::MapFlags::MAP_STACK,
            -1,
            0,
        )
        .map_err(CloneError::Mmap)?
    };

    let signal = Signal::SIGCHLD;
    let combined = clone_flags.bits() | signal as c_int;

    let res = unsafe {
        mman::mprotect(child_stack, page_size, mman::ProtFlags::PROT_NONE).map_err(CloneError::Mprotect)?;

        let child_stack_top = child_stack.add(default_stack_size);

        libc::clone(
            mem::transmute::<extern "C" fn(*mut CloneCb) -> i32, extern "C" fn(*mut c_void) -> i32>(callback),
            child_stack_top,
            combined,
            &mut cb as *mut _ as *mut c_void,
        )
    };

    Errno::result(res).map(Pid::from_raw).map_err(CloneError::Clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd;

    #[test]
    fn clone_enters_new_pid_namespace() {
        let flags = sched::CloneFlags::CLONE_NEWPID | sched::CloneFlags::CLONE_NEWUSER;
        let pid = clone(
            Box::new(|| {
                if unistd::getpid() != Pid::from_raw(1) {
                    return 1;
                }
                0
            }),
            flags,
        )
        .unwrap();

        let status = waitpid(pid, None).unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }

    #[test]
    fn clone_allocates_a_usable_stack() {
        let pid = clone(
            Box::new(|| {
                let mut array_on_stack = [0u8; 4096];
                array_on_stack.iter_mut().for_each(|x| *x = 0);
                0
            }),
            sched::CloneFlags::empty(),
        )
        .unwrap();

        let status = waitpid(pid, None).unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }
}
