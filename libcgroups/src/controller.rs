//! A thin wrapper around a single cgroup v2 directory under the unified
//! hierarchy. Each container gets its own `<DEFAULT_CGROUP_ROOT>/<id>`
//! directory; this module only ever writes the handful of files pocket-docker
//! cares about (`cgroup.procs`, `memory.max`, `cpu.weight`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const CGROUP_PROCS: &str = "cgroup.procs";
const CGROUP_MEMORY_MAX: &str = "memory.max";
const CGROUP_CPU_WEIGHT: &str = "cpu.weight";
pub const CGROUP_MEMORY_EVENTS: &str = "memory.events";

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("failed to create cgroup directory {path}: {err}")]
    CreateDir { path: PathBuf, err: std::io::Error },
    #[error("failed to remove cgroup directory {path}: {err}")]
    RemoveDir { path: PathBuf, err: std::io::Error },
    #[error("failed to write {data} to {path}: {err}")]
    Write {
        path: PathBuf,
        data: String,
        err: std::io::Error,
    },
    #[error("failed to read {path}: {err}")]
    Read { path: PathBuf, err: std::io::Error },
}

fn write_cgroup_file<P: AsRef<Path>>(path: P, data: &str) -> Result<(), CgroupError> {
    let path = path.as_ref();
    OpenOptions::new()
        .write(true)
        .truncate(false)
        .open(path)
        .and_then(|mut f| f.write_all(data.as_bytes()))
        .map_err(|err| CgroupError::Write {
            path: path.to_path_buf(),
            data: data.to_string(),
            err,
        })
}

/// A single container's cgroup v2 directory.
pub struct CgroupController {
    path: PathBuf,
}

impl CgroupController {
    /// Creates `<DEFAULT_CGROUP_ROOT>/<id>`. A read-only or non-permitted
    /// root is a hard error by default; pass `allow_root_fallback` to opt
    /// into reusing the root cgroup itself with no limits applied.
    pub fn create(id: &str, allow_root_fallback: bool) -> Result<Self, CgroupError> {
        Self::create_in(Path::new(DEFAULT_CGROUP_ROOT), id, allow_root_fallback)
    }

    pub fn create_in(root: &Path, id: &str, allow_root_fallback: bool) -> Result<Self, CgroupError> {
        let path = root.join(id);
        match fs::create_dir(&path) {
            Ok(()) => Ok(CgroupController { path }),
            Err(err)
                if allow_root_fallback
                    && matches!(
                        err.raw_os_error(),
                        Some(libc::EROFS) | Some(libc::EPERM)
                    ) =>
            {
                tracing::warn!(?err, ?path, "falling back to root cgroup, no limits will be applied");
                Ok(CgroupController {
                    path: root.to_path_buf(),
                })
            }
            Err(err) => Err(CgroupError::CreateDir { path, err }),
        }
    }

    /// Wraps an already-existing cgroup directory without attempting to
    /// create it, used when reattaching to a container's cgroup for
    /// teardown.
    pub fn at(path: PathBuf) -> Self {
        CgroupController { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_task(&self, pid: Pid) -> Result<(), CgroupError> {
        write_cgroup_file(self.path.join(CGROUP_PROCS), &pid.to_string())
    }

    /// Sets `memory.max` in bytes. `None` leaves the controller's default
    /// (unlimited) in place.
    pub fn apply_memory_limit(&self, limit_bytes: Option<i64>) -> Result<(), CgroupError> {
        let Some(limit) = limit_bytes else {
            return Ok(());
        };
        let value = if limit < 0 {
            "max".to_string()
        } else {
            limit.to_string()
        };
        write_cgroup_file(self.path.join(CGROUP_MEMORY_MAX), &value)
    }

    /// Sets `cpu.weight` (1-10000, cgroup v2's relative-share knob).
    pub fn apply_cpu_weight(&self, weight: Option<u64>) -> Result<(), CgroupError> {
        let Some(weight) = weight else {
            return Ok(());
        };
        write_cgroup_file(self.path.join(CGROUP_CPU_WEIGHT), &weight.to_string())
    }

    /// Removes the cgroup directory. Idempotent: a missing directory is not
    /// an error, since cleanup may run more than once.
    pub fn remove(&self) -> Result<(), CgroupError> {
        if self.path == Path::new(DEFAULT_CGROUP_ROOT) {
            return Ok(());
        }
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CgroupError::RemoveDir {
                path: self.path.clone(),
                err,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_and_remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let ctrl = CgroupController::create_in(tmp.path(), "abc123", false).unwrap();
        assert!(ctrl.path().exists());
        ctrl.remove().unwrap();
        assert!(!ctrl.path().exists());
        // second remove should not error
        ctrl.remove().unwrap();
    }

    #[test]
    fn create_in_fails_closed_when_fallback_not_requested() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("missing-parent").join("also-missing");
        // ENOENT is not EROFS/EPERM, so this must fail regardless of the
        // fallback flag, but also confirms `false` never takes the
        // fallback branch even for the errnos it does recognize.
        let result = CgroupController::create_in(&nested, "x", false);
        assert!(matches!(result, Err(CgroupError::CreateDir { .. })));
        let result = CgroupController::create_in(&nested, "x", true);
        assert!(matches!(result, Err(CgroupError::CreateDir { .. })));
    }

    #[test]
    fn apply_memory_limit_writes_max_for_negative() {
        let tmp = TempDir::new().unwrap();
        let ctrl = CgroupController::create_in(tmp.path(), "mem", false).unwrap();
        fs::write(ctrl.path().join(CGROUP_MEMORY_MAX), "0").unwrap();
        ctrl.apply_memory_limit(Some(-1)).unwrap();
        let got = fs::read_to_string(ctrl.path().join(CGROUP_MEMORY_MAX)).unwrap();
        assert_eq!(got, "max");
    }

    #[test]
    fn apply_memory_limit_none_is_noop() {
        let tmp = TempDir::new().unwrap();
        let ctrl = CgroupController::create_in(tmp.path(), "mem2", false).unwrap();
        // no memory.max file created at all: apply(None) must not try to open it
        ctrl.apply_memory_limit(None).unwrap();
    }
}
