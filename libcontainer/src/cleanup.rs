//! Idempotent teardown, tolerant of already-missing resources at every
//! step. Every step logs and continues on failure: cleanup is the
//! last-resort reversal path and must not fail-stop.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::catalog::ContainerRecord;
use crate::network::{self, CommandRunner, PortMapping};

const SIGTERM_GRACE: Duration = Duration::from_secs(5);
const SIGTERM_POLL: Duration = Duration::from_millis(100);

/// Runs every teardown step for `record`, tolerating "already gone" at
/// each one:
///   1. SIGTERM, wait up to 5s, then SIGKILL.
///   2. Remove the cgroup (joining its OOM monitor).
///   3. If networking was set up, reverse it.
///   4. Unmount and delete the rootfs directory, if one is recorded.
///
/// Removing the log file is the caller's decision: the supervisor does
/// it, the `remove` catalog command does not.
pub fn run(record: &ContainerRecord, runner: &dyn CommandRunner) {
    terminate_process(Pid::from_raw(record.pid as i32));

    if let Err(err) = crate::cgroup::remove_cgroup(&record.id, cgroup_path(&record.id)) {
        tracing::warn!(id = %record.id, ?err, "failed to remove cgroup during cleanup");
    }

    if record.network_setup {
        let ports = parse_ports(&record.ports);
        if let Err(err) = network::cleanup(
            runner,
            &record.id,
            record.ip_suffix as u8,
            &ports,
            &record.ip_forward_orig,
        ) {
            tracing::warn!(id = %record.id, ?err, "network cleanup failed");
        }
    }

    if !record.rootfs_dir.is_empty() {
        teardown_rootfs(Path::new(&record.rootfs_dir));
    }
}

fn cgroup_path(id: &str) -> std::path::PathBuf {
    Path::new(libcgroups::controller::DEFAULT_CGROUP_ROOT).join(id)
}

fn parse_ports(spec: &str) -> Vec<PortMapping> {
    spec.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| network::parse_port_mapping(s).ok())
        .collect()
}

/// SIGTERM, wait up to 5s (polling since we may not be the parent after a
/// detached `run`), then SIGKILL. `ESRCH` at any point means the process
/// is already gone and is not an error.
fn terminate_process(pid: Pid) {
    match signal::kill(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(nix::Error::ESRCH) => return,
        Err(err) => tracing::warn!(?pid, ?err, "SIGTERM failed"),
    }

    let deadline = std::time::Instant::now() + SIGTERM_GRACE;
    while std::time::Instant::now() < deadline {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(SIGTERM_POLL),
            Ok(_) => return,
            Err(nix::Error::ECHILD) => {
                // Not our child (detached reaper already reaped it, or we
                // are a fresh `stop` invocation): fall back to polling
                // liveness via signal 0.
                if !crate::watchdog::is_alive(pid) {
                    return;
                }
                std::thread::sleep(SIGTERM_POLL);
            }
            Err(nix::Error::ESRCH) => return,
            Err(err) => {
                tracing::warn!(?pid, ?err, "waitpid failed during cleanup");
                break;
            }
        }
    }

    match signal::kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(nix::Error::ESRCH) => {}
        Err(err) => tracing::warn!(?pid, ?err, "SIGKILL failed"),
    }
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
}

/// Unmounts `<rootfs>/proc`, `<rootfs>/sys`, and `<rootfs>` with
/// `MNT_DETACH`, walks the tree chmod'ing files to 0777 to defeat stray
/// read-only entries left by the container image, then removes the
/// directory tree.
fn teardown_rootfs(rootfs: &Path) {
    use nix::mount::{umount2, MntFlags};

    for sub in ["proc", "sys"] {
        let path = rootfs.join(sub);
        if let Err(err) = umount2(&path, MntFlags::MNT_DETACH) {
            if err != nix::Error::EINVAL && err != nix::Error::ENOENT {
                tracing::debug!(?path, ?err, "unmount failed during cleanup");
            }
        }
    }
    if let Err(err) = umount2(rootfs, MntFlags::MNT_DETACH) {
        if err != nix::Error::EINVAL && err != nix::Error::ENOENT {
            tracing::debug!(?rootfs, ?err, "unmount of rootfs root failed");
        }
    }

    chmod_tree_permissive(rootfs);

    if let Err(err) = std::fs::remove_dir_all(rootfs) {
        tracing::warn!(?rootfs, ?err, "failed to remove rootfs directory");
    }
}

fn chmod_tree_permissive(root: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777));
        if path.is_dir() && !path.is_symlink() {
            chmod_tree_permissive(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ContainerState;
    use crate::network::test_support::RecordingCommandRunner;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_record(rootfs: &Path) -> ContainerRecord {
        ContainerRecord {
            id: "deadbeef00000000000000000000000".to_string(),
            name: "busybox".to_string(),
            image: "busybox".to_string(),
            pid: 999_999, // not a real process
            state: ContainerState::Running,
            started_at: Utc::now(),
            rootfs_dir: rootfs.to_string_lossy().to_string(),
            restart_count: 0,
            health_cmd: String::new(),
            health_interval_seconds: 30,
            restart_max: 0,
            ports: String::new(),
            ip_forward_orig: String::new(),
            network_setup: false,
            ip_suffix: 0,
        }
    }

    #[test]
    fn cleanup_removes_rootfs_directory() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("proc")).unwrap();
        std::fs::write(rootfs.join("file"), b"hi").unwrap();

        let record = sample_record(&rootfs);
        let runner = RecordingCommandRunner::default();
        run(&record, &runner);

        assert!(!rootfs.exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        let record = sample_record(&rootfs);
        let runner = RecordingCommandRunner::default();
        run(&record, &runner);
        // second call: rootfs already gone, process already gone. Must not panic.
        run(&record, &runner);
    }
}
