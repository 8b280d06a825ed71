//! The `run` pipeline: orchestrates rootfs extraction, the isolation
//! primitive, cgroup/network wiring, logging, the watchdog, and the
//! restart decision for each attempt.

use std::path::PathBuf;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{Gid, Pid, Uid};

use crate::archive::{self, ArchiveError};
use crate::catalog::{Catalog, CatalogError, ContainerRecord, ContainerState};
use crate::context::CancelToken;
use crate::id;
use crate::logs;
use crate::network::{self, CommandRunner, NetworkError, PortMapping};
use crate::process::{self, ChildIo, ProcessError};

const MIN_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

pub type Runner = Arc<dyn CommandRunner + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("--interactive and --detach are mutually exclusive")]
    InteractiveAndDetach,
    #[error("--tty and --detach are mutually exclusive")]
    TtyAndDetach,
    #[error("rootfs extraction failed: {0}")]
    Archive(#[from] ArchiveError),
    #[error("failed to clone isolated process: {0}")]
    Process(#[from] ProcessError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("network setup failed: {0}")]
    Network(#[from] NetworkError),
    #[error("cgroup error: {0}")]
    Cgroup(#[from] libcgroups::CgroupError),
    #[error("log pipeline error: {0}")]
    Log(#[from] crate::logs::LogError),
}

type Result<T> = std::result::Result<T, SupervisorError>;

pub struct RunRequest {
    pub rootfs_source: PathBuf,
    pub image_name: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub memory_bytes: Option<i64>,
    pub cpu_shares: Option<u64>,
    pub ports: Vec<PortMapping>,
    pub network: bool,
    pub health_cmd: String,
    pub health_interval: Duration,
    pub restart_max: i64,
    pub detach: bool,
    pub interactive: bool,
    pub tty: bool,
}

pub struct Paths {
    pub home: PathBuf,
    pub sudo_owner: Option<(Uid, Gid)>,
}

impl Paths {
    pub fn pocket_docker_dir(&self) -> PathBuf {
        self.home.join(".pocket-docker")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.pocket_docker_dir().join("runs")
    }

    pub fn state_db(&self) -> PathBuf {
        self.pocket_docker_dir().join("state.db")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.pocket_docker_dir().join("images")
    }
}

/// Runs `req` to completion (foreground) or hands off to a detached
/// reaper and returns immediately (detached), printing the container id
/// to stdout exactly once on the first attempt.
pub fn run(req: RunRequest, paths: &Paths, runner: Runner, privileged: bool) -> Result<()> {
    if req.interactive && req.detach {
        return Err(SupervisorError::InteractiveAndDetach);
    }
    if req.tty && req.detach {
        return Err(SupervisorError::TtyAndDetach);
    }

    let id = id::generate_id();
    let catalog = Catalog::open(&paths.state_db())?;

    let mut restart_count = 0i64;
    let mut first_attempt = true;

    loop {
        let outcome = run_one_attempt(
            &req,
            paths,
            &runner,
            &catalog,
            &id,
            restart_count,
            first_attempt,
            privileged,
        )?;
        first_attempt = false;

        if matches!(outcome, AttemptOutcome::Detached) {
            return Ok(());
        }

        match decide_restart(req.restart_max, restart_count) {
            RestartDecision::Stop => {
                catalog.update_container_state(&id, ContainerState::Stopped)?;
                return Ok(());
            }
            RestartDecision::Restart => {
                restart_count += 1;
                let _ = logs::append(&paths.home, &id, &format!("Restart #{restart_count} ..."));
                continue;
            }
        }
    }
}

enum RestartDecision {
    Stop,
    Restart,
}

/// `restart_max == 0` never restarts; `-1` always does; `n>0` restarts
/// while `restart_count_before_increment < n` (so the loop runs at most
/// `n+1` times total).
fn decide_restart(restart_max: i64, restart_count_before_increment: i64) -> RestartDecision {
    if restart_max == -1 {
        return RestartDecision::Restart;
    }
    if restart_max > 0 && restart_count_before_increment < restart_max {
        return RestartDecision::Restart;
    }
    RestartDecision::Stop
}

enum AttemptOutcome {
    Detached,
    Exited,
}

#[allow(clippy::too_many_arguments)]
fn run_one_attempt(
    req: &RunRequest,
    paths: &Paths,
    runner: &Runner,
    catalog: &Catalog,
    id: &str,
    restart_count: i64,
    first_attempt: bool,
    privileged: bool,
) -> Result<AttemptOutcome> {
    let rootfs_dir = archive::materialize_rootfs(&paths.runs_dir(), id, &req.rootfs_source)?;

    let mut cloned = process::clone_and_run(&req.cmd, &req.args, &rootfs_dir, req.interactive, req.tty)?;

    let host_uid = Uid::current();
    let host_gid = Gid::current();
    if let Err(err) = process::write_id_mappings(cloned.pid, host_uid, host_gid) {
        tracing::warn!(?err, "failed to write id mappings, killing child");
        let _ = nix::sys::signal::kill(cloned.pid, nix::sys::signal::Signal::SIGKILL);
        let _ = waitpid(cloned.pid, None);
        return Err(err.into());
    }

    let record = ContainerRecord {
        id: id.to_string(),
        name: req.image_name.clone(),
        image: req.image_name.clone(),
        pid: cloned.pid.as_raw() as i64,
        state: ContainerState::Running,
        started_at: Utc::now(),
        rootfs_dir: rootfs_dir.to_string_lossy().to_string(),
        restart_count,
        health_cmd: req.health_cmd.clone(),
        health_interval_seconds: req.health_interval.as_secs() as i64,
        restart_max: req.restart_max,
        ports: ports_to_string(&req.ports),
        ip_forward_orig: String::new(),
        network_setup: false,
        ip_suffix: 0,
    };
    catalog.save_container(&record)?;
    let mut final_record = record.clone();

    if let Err(err) = apply_cgroup_limits(id, cloned.pid, req.memory_bytes, req.cpu_shares) {
        tracing::error!(?err, "failed to apply cgroup limits, killing child");
        let _ = nix::sys::signal::kill(cloned.pid, nix::sys::signal::Signal::SIGKILL);
        let _ = waitpid(cloned.pid, None);
        return Err(err.into());
    }

    if req.network {
        let in_use = running_suffixes(catalog)?;
        let suffix = id::derive_ip_suffix(id, |candidate| in_use.contains(&candidate));
        match network::setup(runner.as_ref(), cloned.pid, id, &req.ports, suffix, privileged) {
            Ok(setup) => {
                final_record.network_setup = true;
                final_record.ip_suffix = suffix as i64;
                final_record.ip_forward_orig = setup.orig_ip_forward;
                catalog.save_container(&final_record)?;
            }
            Err(err) => {
                let _ = nix::sys::signal::kill(cloned.pid, nix::sys::signal::Signal::SIGKILL);
                let _ = waitpid(cloned.pid, None);
                return Err(err.into());
            }
        }
    }

    cloned.release();

    if first_attempt {
        println!("{id}");
    }

    if req.detach {
        spawn_detached_reaper(final_record, paths.state_db(), runner.clone());
        return Ok(AttemptOutcome::Detached);
    }

    let cancel = CancelToken::new();
    let (events_tx, events_rx) = channel::<SupervisorEvent>();

    if let Some(mut reader) = attach_log_pipeline(paths, id, cloned.io, cancel.clone())? {
        std::thread::spawn(move || {
            let mut stdout = std::io::stdout();
            let _ = std::io::copy(&mut reader, &mut stdout);
        });
    }

    spawn_watchdog(req, runner.clone(), cloned.pid, cancel.clone(), events_tx.clone());
    spawn_reaper(cloned.pid, events_tx);

    let event = events_rx.recv();
    cancel.cancel();

    if let Ok(SupervisorEvent::HealthFailed) = event {
        let _ = logs::append(&paths.home, id, "FAILED health-check");
    }

    crate::cleanup::run(&final_record, runner.as_ref());

    Ok(AttemptOutcome::Exited)
}

enum SupervisorEvent {
    HealthFailed,
    Exited,
}

fn spawn_watchdog(req: &RunRequest, runner: Runner, pid: Pid, cancel: CancelToken, notify: Sender<SupervisorEvent>) {
    let interval = req.health_interval.max(MIN_WATCHDOG_INTERVAL);
    let health_cmd = req.health_cmd.clone();
    std::thread::spawn(move || {
        let (tx, rx) = channel();
        crate::watchdog::run(runner.as_ref(), pid, &health_cmd, interval, &cancel, &tx);
        if rx.try_recv().is_ok() {
            let _ = notify.send(SupervisorEvent::HealthFailed);
        }
    });
}

fn spawn_reaper(pid: Pid, notify: Sender<SupervisorEvent>) {
    std::thread::spawn(move || loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::StillAlive) => continue,
            Ok(_) | Err(_) => {
                let _ = notify.send(SupervisorEvent::Exited);
                return;
            }
        }
    });
}

fn spawn_detached_reaper(record: ContainerRecord, db_path: PathBuf, runner: Runner) {
    std::thread::spawn(move || {
        let pid = Pid::from_raw(record.pid as i32);
        let _ = waitpid(pid, None);
        if let Ok(catalog) = Catalog::open(&db_path) {
            let _ = catalog.update_container_state(&record.id, ContainerState::Stopped);
        }
        crate::cleanup::run(&record, runner.as_ref());
    });
}

fn apply_cgroup_limits(
    id: &str,
    pid: Pid,
    memory_bytes: Option<i64>,
    cpu_shares: Option<u64>,
) -> std::result::Result<(), libcgroups::CgroupError> {
    match (memory_bytes, cpu_shares) {
        (None, None) => Ok(()),
        (Some(bytes), cpu) => {
            let controller = crate::cgroup::apply_memory_limit(id, pid, bytes)?;
            if let Some(weight) = cpu {
                crate::cgroup::apply_cpu_shares(&controller, weight)?;
            }
            Ok(())
        }
        (None, Some(weight)) => {
            let controller = crate::cgroup::create_and_attach(id, pid)?;
            crate::cgroup::apply_cpu_shares(&controller, weight)
        }
    }
}

fn attach_log_pipeline(paths: &Paths, id: &str, io: ChildIo, cancel: CancelToken) -> Result<Option<std::fs::File>> {
    let reader = match io {
        ChildIo::Pty { master } => {
            use std::os::fd::{AsRawFd, FromRawFd};
            let dup_fd = unsafe { libc::dup(master.as_raw_fd()) };
            let source = unsafe { std::fs::File::from_raw_fd(dup_fd) };
            logs::attach_cancelable(&paths.home, id, source, paths.sudo_owner, cancel)?
        }
        ChildIo::Pipes { stdin_writer, stdout_reader } => {
            drop(stdin_writer);
            logs::attach_cancelable(&paths.home, id, stdout_reader, paths.sudo_owner, cancel)?
        }
    };
    Ok(Some(reader))
}

fn ports_to_string(ports: &[PortMapping]) -> String {
    ports
        .iter()
        .map(|p| format!("{}:{}", p.host, p.container))
        .collect::<Vec<_>>()
        .join(",")
}

/// Suffixes already claimed by other `Running`, network-enabled containers
/// in the catalog: the collision probe in `id.rs` checks against this set
/// rather than live host interfaces, since cleanup already guarantees a
/// stopped container's suffix is free.
fn running_suffixes(catalog: &Catalog) -> Result<std::collections::HashSet<u8>> {
    Ok(catalog
        .list_containers()?
        .into_iter()
        .filter(|r| r.state == ContainerState::Running && r.network_setup)
        .map(|r| r.ip_suffix as u8)
        .collect())
}

pub fn parse_ports(spec: &str) -> Vec<PortMapping> {
    spec.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| network::parse_port_mapping(s).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_zero_never_restarts() {
        assert!(matches!(decide_restart(0, 0), RestartDecision::Stop));
    }

    #[test]
    fn restart_bounded_stops_after_n() {
        assert!(matches!(decide_restart(2, 0), RestartDecision::Restart));
        assert!(matches!(decide_restart(2, 1), RestartDecision::Restart));
        assert!(matches!(decide_restart(2, 2), RestartDecision::Stop));
    }

    #[test]
    fn restart_unlimited_always_restarts() {
        assert!(matches!(decide_restart(-1, 1_000), RestartDecision::Restart));
    }

    #[test]
    fn ports_round_trip_through_string() {
        let ports = vec![PortMapping { host: 8080, container: 80 }];
        let s = ports_to_string(&ports);
        assert_eq!(s, "8080:80");
        let parsed = parse_ports(&s);
        assert_eq!(parsed[0].host, 8080);
        assert_eq!(parsed[0].container, 80);
    }
}
