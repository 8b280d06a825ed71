//! The supervisor's liveness/health watchdog: ticks on an interval and
//! notifies on the first failed check. Shares `exec::build_nsenter_argv`/
//! `health_check_argv` with the exec-join path so both go through the
//! same `nsenter` argv construction.

use std::sync::mpsc::Sender;
use std::time::Duration;

use nix::sys::signal;
use nix::unistd::Pid;

use crate::context::CancelToken;
use crate::exec::{build_nsenter_argv, health_check_argv};
use crate::network::CommandRunner;

/// What the watchdog tells the supervisor when it stops on its own
/// (liveness/health failure). A cancelled watchdog sends nothing.
pub struct WatchdogFailure;

/// Runs on its own thread until `cancel` fires or a check fails, in which
/// case it sends on `notify` and returns. `interval` is clamped to at
/// least 30s by the caller.
pub fn run(
    runner: &dyn CommandRunner,
    pid: Pid,
    health_cmd: &str,
    interval: Duration,
    cancel: &CancelToken,
    notify: &Sender<WatchdogFailure>,
) {
    loop {
        if cancel.sleep(interval) {
            return;
        }
        let healthy = if health_cmd.is_empty() {
            signal::kill(pid, None).is_ok()
        } else {
            run_health_cmd(runner, pid, health_cmd)
        };
        if !healthy {
            let _ = notify.send(WatchdogFailure);
            return;
        }
    }
}

fn run_health_cmd(runner: &dyn CommandRunner, pid: Pid, health_cmd: &str) -> bool {
    let argv = health_check_argv(health_cmd);
    let nsenter_args = build_nsenter_argv(pid, &argv);
    runner.run("nsenter", &nsenter_args).is_ok()
}

/// `kill(pid, 0)`-style liveness probe shared by the `list` command's
/// reconciliation pass and the no-health-cmd watchdog path: `ESRCH` means
/// dead, `EPERM` counts as alive (the process exists, we just can't signal
/// it).
pub fn is_alive(pid: Pid) -> bool {
    match signal::kill(pid, None) {
        Ok(()) => true,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::RecordingCommandRunner;
    use std::sync::mpsc::channel;

    #[test]
    fn watchdog_notifies_when_pid_liveness_check_fails() {
        // A pid astronomically unlikely to be in use, so kill(pid, 0)
        // returns ESRCH and the watchdog treats it as dead.
        let runner = RecordingCommandRunner::default();
        let (tx, rx) = channel();
        let cancel = CancelToken::new();
        run(
            &runner,
            Pid::from_raw(i32::MAX - 1),
            "",
            Duration::from_millis(1),
            &cancel,
            &tx,
        );
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn watchdog_stops_without_notifying_on_cancel() {
        let runner = RecordingCommandRunner::default();
        let (tx, rx) = channel();
        let cancel = CancelToken::new();
        cancel.cancel();
        run(&runner, Pid::from_raw(1), "", Duration::from_secs(5), &cancel, &tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn health_cmd_path_runs_through_command_runner() {
        let runner = RecordingCommandRunner::default();
        let (tx, rx) = channel();
        let cancel = CancelToken::new();
        run(
            &runner,
            Pid::from_raw(123),
            "curl localhost/health",
            Duration::from_millis(1),
            &cancel,
            &tx,
        );
        // RecordingCommandRunner::run always succeeds, so the loop should
        // have been cancellable rather than failing on the first tick;
        // force a stop by cancelling from here and checking argv shape.
        cancel.cancel();
        let calls = runner.calls.lock().unwrap();
        assert!(calls.iter().any(|(cmd, args)| cmd == "nsenter"
            && args.contains(&"curl".to_string())
            && args.contains(&"localhost/health".to_string())));
        let _ = rx.try_recv();
    }
}
