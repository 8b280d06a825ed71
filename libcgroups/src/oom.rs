//! OOM event monitor: one background thread per running container, polling
//! `memory.events` for a non-zero `oom`/`oom_kill` counter and delivering
//! SIGKILL to the container's init pid when the kernel's OOM killer has
//! fired inside the cgroup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;

use crate::controller::CGROUP_MEMORY_EVENTS;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct OomMonitorHandle {
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

static MONITORS: Lazy<Mutex<HashMap<String, OomMonitorHandle>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Starts polling `<cgroup_dir>/memory.events` for container `id`, killing
/// `pid` the moment an `oom ` or `oom_kill ` line reports a non-zero count.
/// Replaces any existing monitor already registered for `id`.
pub fn spawn_oom_monitor(id: &str, cgroup_dir: std::path::PathBuf, pid: Pid) {
    stop_oom_monitor(id);

    let cancel = Arc::new(AtomicBool::new(false));
    let thread_cancel = cancel.clone();
    let id_owned = id.to_string();
    let join = std::thread::spawn(move || {
        let events_path = cgroup_dir.join(CGROUP_MEMORY_EVENTS);
        while !thread_cancel.load(Ordering::Relaxed) {
            if let Ok(contents) = std::fs::read_to_string(&events_path) {
                if memory_events_report_oom(&contents) {
                    tracing::warn!(id = %id_owned, ?pid, "oom killer fired, killing container");
                    let _ = signal::kill(pid, Signal::SIGKILL);
                    return;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    });

    MONITORS.lock().unwrap().insert(
        id.to_string(),
        OomMonitorHandle {
            cancel,
            join: Some(join),
        },
    );
}

/// Stops and joins the monitor thread for `id`, if one is registered. Safe
/// to call on an id with no monitor (cleanup may run more than once).
pub fn stop_oom_monitor(id: &str) {
    let handle = MONITORS.lock().unwrap().remove(id);
    if let Some(mut handle) = handle {
        handle.cancel.store(true, Ordering::Relaxed);
        if let Some(join) = handle.join.take() {
            let _ = join.join();
        }
    }
}

fn memory_events_report_oom(contents: &str) -> bool {
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else { continue };
        if key != "oom" && key != "oom_kill" {
            continue;
        }
        if let Some(value) = parts.next() {
            if value.parse::<u64>().unwrap_or(0) > 0 {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_oom_kill_line() {
        let contents = "low 0\nhigh 0\nmax 0\noom 0\noom_kill 1\n";
        assert!(memory_events_report_oom(contents));
    }

    #[test]
    fn ignores_zeroed_events() {
        let contents = "low 0\nhigh 0\nmax 0\noom 0\noom_kill 0\n";
        assert!(!memory_events_report_oom(contents));
    }
}
