//! Wires the supervisor to `libcgroups`, adding the OOM-monitor lifecycle
//! on top of the bare controller.

use std::path::PathBuf;

use libcgroups::{CgroupController, CgroupError};
use nix::unistd::Pid;

/// Creates `<root>/<id>` and attaches `pid`, without applying any limit or
/// starting the OOM monitor. Used when only `--cpu-shares` is requested
/// (no memory limit, so no OOM events to watch). A read-only or
/// non-permitted cgroup root is a hard error: this runtime never falls
/// back to the root cgroup silently.
pub fn create_and_attach(id: &str, pid: Pid) -> Result<CgroupController, CgroupError> {
    let controller = CgroupController::create(id, false)?;
    controller.add_task(pid)?;
    Ok(controller)
}

pub fn apply_memory_limit(id: &str, pid: Pid, bytes: i64) -> Result<CgroupController, CgroupError> {
    let controller = CgroupController::create(id, false)?;
    controller.add_task(pid)?;
    controller.apply_memory_limit(Some(bytes))?;
    libcgroups::spawn_oom_monitor(id, controller.path().to_path_buf(), pid);
    Ok(controller)
}

pub fn apply_cpu_shares(controller: &CgroupController, weight: u64) -> Result<(), CgroupError> {
    controller.apply_cpu_weight(Some(weight))
}

/// Cancels and joins the OOM monitor before removing the directory, so
/// the monitor never races with the `rmdir` underneath it.
pub fn remove_cgroup(id: &str, path: PathBuf) -> Result<(), CgroupError> {
    libcgroups::stop_oom_monitor(id);
    CgroupController::at(path).remove()
}
