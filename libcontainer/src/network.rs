//! The veth/NAT network fabric: creates a host/container veth pair,
//! addresses and routes the container side, adds FORWARD and NAT rules for
//! port mappings, and captures/restores `ip_forward` around a privileged
//! run. External tools are invoked through [`CommandRunner`] so tests can
//! assert on exact argv without touching the host's network stack.

use std::path::{Path, PathBuf};
use std::process::Command;

use nix::unistd::Pid;

use crate::id::{veth_host_name, veth_peer_name};

pub const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";
const SUBNET_PREFIX: &str = "10.42.0";

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("command {cmd} {args:?} failed: {detail}")]
    CommandFailed {
        cmd: String,
        args: Vec<String>,
        detail: String,
    },
    #[error("failed to read {path}: {err}")]
    ReadSysctl { path: PathBuf, err: std::io::Error },
    #[error("failed to write {path}: {err}")]
    WriteSysctl { path: PathBuf, err: std::io::Error },
    #[error("invalid port spec {0:?}, expected H:C")]
    InvalidPortSpec(String),
}

type Result<T> = std::result::Result<T, NetworkError>;

/// Every external-tool invocation the fabric makes goes through this
/// trait so tests can assert on exact argv without touching the host's
/// real network stack.
pub trait CommandRunner {
    fn run(&self, cmd: &str, args: &[String]) -> Result<()>;
    /// `true` iff `cmd args` (an iptables `-C` check, conventionally)
    /// exits successfully, i.e. the rule is already present.
    fn rule_exists(&self, cmd: &str, args: &[String]) -> bool;
    fn read_sysctl(&self, path: &Path) -> Result<String>;
    fn write_sysctl(&self, path: &Path, contents: &str) -> Result<()>;
    /// Spawns an already-configured `Command` (stdio, `pre_exec`, etc. set
    /// by the caller) and returns a handle exposing its pid and exit
    /// status separately, for callers (the exec-join path) that need the
    /// pid while the process is still running and its real exit code
    /// rather than `run`'s pass/fail signal. Recording doubles introspect
    /// `command`'s program/args via `Command::get_program`/`get_args`
    /// instead of actually spawning it.
    fn spawn(&self, command: Command) -> Result<Box<dyn SpawnedProcess>>;
}

/// A process spawned via [`CommandRunner::spawn`].
pub trait SpawnedProcess {
    fn pid(&self) -> i32;
    fn wait(&mut self) -> Result<i32>;
}

struct RealProcess(std::process::Child);

impl SpawnedProcess for RealProcess {
    fn pid(&self) -> i32 {
        self.0.id() as i32
    }

    fn wait(&mut self) -> Result<i32> {
        let status = self.0.wait().map_err(|err| NetworkError::CommandFailed {
            cmd: "<spawned process>".to_string(),
            args: vec![],
            detail: err.to_string(),
        })?;
        Ok(status.code().unwrap_or(-1))
    }
}

fn command_argv(command: &Command) -> (String, Vec<String>) {
    let cmd = command.get_program().to_string_lossy().into_owned();
    let args = command
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    (cmd, args)
}

pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, cmd: &str, args: &[String]) -> Result<()> {
        let status = Command::new(cmd)
            .args(args)
            .status()
            .map_err(|err| NetworkError::CommandFailed {
                cmd: cmd.to_string(),
                args: args.to_vec(),
                detail: err.to_string(),
            })?;
        if !status.success() {
            return Err(NetworkError::CommandFailed {
                cmd: cmd.to_string(),
                args: args.to_vec(),
                detail: format!("exit status {status}"),
            });
        }
        Ok(())
    }

    fn rule_exists(&self, cmd: &str, args: &[String]) -> bool {
        Command::new(cmd)
            .args(args)
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn read_sysctl(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path).map_err(|err| NetworkError::ReadSysctl {
            path: path.to_path_buf(),
            err,
        })
    }

    fn write_sysctl(&self, path: &Path, contents: &str) -> Result<()> {
        std::fs::write(path, contents).map_err(|err| NetworkError::WriteSysctl {
            path: path.to_path_buf(),
            err,
        })
    }

    fn spawn(&self, mut command: Command) -> Result<Box<dyn SpawnedProcess>> {
        let child = command.spawn().map_err(|err| {
            let (cmd, args) = command_argv(&command);
            NetworkError::CommandFailed {
                cmd,
                args,
                detail: err.to_string(),
            }
        })?;
        Ok(Box::new(RealProcess(child)))
    }
}

#[derive(Debug, Clone)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

pub fn parse_port_mapping(spec: &str) -> Result<PortMapping> {
    let (host, container) = spec
        .split_once(':')
        .ok_or_else(|| NetworkError::InvalidPortSpec(spec.to_string()))?;
    let host: u16 = host
        .parse()
        .map_err(|_| NetworkError::InvalidPortSpec(spec.to_string()))?;
    let container: u16 = container
        .parse()
        .map_err(|_| NetworkError::InvalidPortSpec(spec.to_string()))?;
    Ok(PortMapping { host, container })
}

#[derive(Debug, Clone)]
pub struct NetworkSetup {
    pub orig_ip_forward: String,
    pub suffix: u8,
}

/// Performs the full veth/routing/firewall setup sequence, reversing
/// every prior step if a later one fails.
pub fn setup(
    runner: &dyn CommandRunner,
    pid: Pid,
    id: &str,
    ports: &[PortMapping],
    suffix: u8,
    privileged: bool,
) -> Result<NetworkSetup> {
    let orig_ip_forward = runner
        .read_sysctl(Path::new(IP_FORWARD_PATH))
        .unwrap_or_default();

    if let Err(err) = setup_inner(runner, pid, id, ports, suffix, privileged) {
        let _ = cleanup(runner, id, suffix, ports, &orig_ip_forward);
        return Err(err);
    }

    Ok(NetworkSetup {
        orig_ip_forward,
        suffix,
    })
}

fn setup_inner(
    runner: &dyn CommandRunner,
    pid: Pid,
    id: &str,
    ports: &[PortMapping],
    suffix: u8,
    privileged: bool,
) -> Result<()> {
    let host_veth = veth_host_name(id);
    let peer_veth = veth_peer_name(id);
    let container_addr = format!("{SUBNET_PREFIX}.{suffix}/24");

    runner.run(
        "ip",
        &args(["link", "add", &host_veth, "type", "veth", "peer", "name", &peer_veth]),
    )?;
    runner.run("ip", &args(["addr", "add", "10.42.0.1/24", "dev", &host_veth]))?;
    runner.run("ip", &args(["link", "set", &host_veth, "up"]))?;
    runner.run("ip", &args(["link", "set", &peer_veth, "netns", &pid.to_string()]))?;

    let ns = |more: &[&str]| -> Vec<String> {
        let mut v = vec!["--target".to_string(), pid.to_string(), "--net".to_string()];
        v.extend(more.iter().map(|s| s.to_string()));
        v
    };
    runner.run("nsenter", &ns(&["ip", "link", "set", "lo", "up"]))?;
    runner.run("nsenter", &ns(&["ip", "link", "set", &peer_veth, "up"]))?;
    runner.run("nsenter", &ns(&["ip", "addr", "add", &container_addr, "dev", &peer_veth]))?;
    runner.run("nsenter", &ns(&["ip", "route", "add", "default", "via", "10.42.0.1"]))?;

    if privileged {
        runner.write_sysctl(Path::new(IP_FORWARD_PATH), "1")?;
    }

    add_rule_if_absent(runner, None, "FORWARD", &args(["-o", &host_veth, "-j", "ACCEPT"]))?;
    add_rule_if_absent(runner, None, "FORWARD", &args(["-i", &host_veth, "-j", "ACCEPT"]))?;

    for port in ports {
        let dest = format!("{SUBNET_PREFIX}.{suffix}:{}", port.container);
        add_rule_if_absent(
            runner,
            Some("nat"),
            "PREROUTING",
            &args([
                "-p",
                "tcp",
                "-m",
                "tcp",
                "--dport",
                &port.host.to_string(),
                "-j",
                "DNAT",
                "--to-destination",
                &dest,
            ]),
        )?;
        add_rule_if_absent(
            runner,
            Some("nat"),
            "OUTPUT",
            &args([
                "-p",
                "tcp",
                "-m",
                "tcp",
                "--dport",
                &port.host.to_string(),
                "-j",
                "DNAT",
                "--to-destination",
                &dest,
            ]),
        )?;
        add_rule_if_absent(
            runner,
            Some("nat"),
            "POSTROUTING",
            &args(["-s", &format!("{SUBNET_PREFIX}.{suffix}/32"), "-j", "MASQUERADE"]),
        )?;
    }

    Ok(())
}

/// Reverses the host veth (which implicitly removes its peer), every rule
/// added by `setup`, and restores `ip_forward` if a prior value was
/// captured. Idempotent and tolerant of missing resources: every step's
/// failure is logged, not propagated. `suffix` and `ports` must match
/// the values `setup` was called with (cleanup never reads live state,
/// only `(id, suffix, ports)`).
pub fn cleanup(
    runner: &dyn CommandRunner,
    id: &str,
    suffix: u8,
    ports: &[PortMapping],
    orig_ip_forward: &str,
) -> Result<()> {
    let host_veth = veth_host_name(id);
    log_if_err(runner.run("ip", &args(["link", "del", &host_veth])));

    log_if_err(delete_rule(runner, None, "FORWARD", &args(["-o", &host_veth, "-j", "ACCEPT"])));
    log_if_err(delete_rule(runner, None, "FORWARD", &args(["-i", &host_veth, "-j", "ACCEPT"])));

    for port in ports {
        let dest = format!("{SUBNET_PREFIX}.{suffix}:{}", port.container);
        let dnat_spec = args([
            "-p",
            "tcp",
            "-m",
            "tcp",
            "--dport",
            &port.host.to_string(),
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
        ]);
        log_if_err(delete_rule(runner, Some("nat"), "PREROUTING", &dnat_spec));
        log_if_err(delete_rule(runner, Some("nat"), "OUTPUT", &dnat_spec));
        log_if_err(delete_rule(
            runner,
            Some("nat"),
            "POSTROUTING",
            &args(["-s", &format!("{SUBNET_PREFIX}.{suffix}/32"), "-j", "MASQUERADE"]),
        ));
    }

    if !orig_ip_forward.is_empty() {
        log_if_err(runner.write_sysctl(Path::new(IP_FORWARD_PATH), orig_ip_forward));
    }

    Ok(())
}

fn log_if_err(result: Result<()>) {
    if let Err(err) = result {
        tracing::warn!(?err, "network cleanup step failed, continuing");
    }
}

fn add_rule_if_absent(
    runner: &dyn CommandRunner,
    table: Option<&str>,
    chain: &str,
    spec: &[String],
) -> Result<()> {
    if rule_present(runner, table, chain, spec) {
        return Ok(());
    }
    runner.run("iptables", &rule_args(table, "-A", chain, spec))
}

fn delete_rule(
    runner: &dyn CommandRunner,
    table: Option<&str>,
    chain: &str,
    spec: &[String],
) -> Result<()> {
    if !rule_present(runner, table, chain, spec) {
        return Ok(());
    }
    runner.run("iptables", &rule_args(table, "-D", chain, spec))
}

fn rule_present(runner: &dyn CommandRunner, table: Option<&str>, chain: &str, spec: &[String]) -> bool {
    runner.rule_exists("iptables", &rule_args(table, "-C", chain, spec))
}

fn rule_args(table: Option<&str>, verb: &str, chain: &str, spec: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(table) = table {
        out.push("-t".to_string());
        out.push(table.to_string());
    }
    out.push(verb.to_string());
    out.push(chain.to_string());
    out.extend(spec.iter().cloned());
    out
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingCommandRunner {
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
        pub rule_present: Mutex<bool>,
        pub sysctl: Mutex<String>,
        /// Exit code handed back by `spawn`'s recorded process handle.
        pub spawn_exit_code: Mutex<i32>,
    }

    struct RecordedProcess {
        exit_code: i32,
    }

    impl SpawnedProcess for RecordedProcess {
        fn pid(&self) -> i32 {
            1
        }

        fn wait(&mut self) -> Result<i32> {
            Ok(self.exit_code)
        }
    }

    impl CommandRunner for RecordingCommandRunner {
        fn run(&self, cmd: &str, args: &[String]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((cmd.to_string(), args.to_vec()));
            Ok(())
        }

        fn rule_exists(&self, _cmd: &str, _args: &[String]) -> bool {
            *self.rule_present.lock().unwrap()
        }

        fn read_sysctl(&self, _path: &Path) -> Result<String> {
            Ok(self.sysctl.lock().unwrap().clone())
        }

        fn write_sysctl(&self, _path: &Path, contents: &str) -> Result<()> {
            *self.sysctl.lock().unwrap() = contents.to_string();
            Ok(())
        }

        fn spawn(&self, command: Command) -> Result<Box<dyn SpawnedProcess>> {
            let (cmd, args) = command_argv(&command);
            self.calls.lock().unwrap().push((cmd, args));
            Ok(Box::new(RecordedProcess {
                exit_code: *self.spawn_exit_code.lock().unwrap(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingCommandRunner;
    use super::*;

    #[test]
    fn setup_issues_commands_in_expected_order() {
        let runner = RecordingCommandRunner::default();
        let id = "abcdef0123456789";
        let suffix = (0xabcdefu32 % 250) as u8 + 2;
        let ports = vec![PortMapping { host: 8080, container: 80 }];

        setup(&runner, Pid::from_raw(123), id, &ports, suffix, true).unwrap();

        let calls = runner.calls.lock().unwrap();
        let expected: Vec<(&str, Vec<String>)> = vec![
            ("ip", args(["link", "add", "vethabcdef01", "type", "veth", "peer", "name", "vethabcdef01_c"])),
            ("ip", args(["addr", "add", "10.42.0.1/24", "dev", "vethabcdef01"])),
            ("ip", args(["link", "set", "vethabcdef01", "up"])),
            ("ip", args(["link", "set", "vethabcdef01_c", "netns", "123"])),
            ("nsenter", {
                let mut v = vec!["--target".to_string(), "123".to_string(), "--net".to_string()];
                v.extend(args(["ip", "link", "set", "lo", "up"]));
                v
            }),
        ];

        for (i, (cmd, expected_args)) in expected.iter().enumerate() {
            assert_eq!(calls[i].0, *cmd);
            assert_eq!(&calls[i].1, expected_args);
        }

        // FORWARD rules and DNAT/MASQUERADE rules are present among the tail calls.
        let tail: Vec<_> = calls.iter().map(|(c, a)| (c.as_str(), a.clone())).collect();
        assert!(tail.contains(&("iptables", args(["-A", "FORWARD", "-o", "vethabcdef01", "-j", "ACCEPT"]))));
        assert!(tail.contains(&("iptables", args(["-A", "FORWARD", "-i", "vethabcdef01", "-j", "ACCEPT"]))));
        let dest = format!("10.42.0.{suffix}:80");
        assert!(tail.iter().any(|(c, a)| *c == "iptables"
            && a.contains(&"PREROUTING".to_string())
            && a.contains(&dest)));
    }

    #[test]
    fn present_rules_are_not_readded() {
        let runner = RecordingCommandRunner::default();
        *runner.rule_present.lock().unwrap() = true;
        add_rule_if_absent(&runner, None, "FORWARD", &args(["-o", "veth0", "-j", "ACCEPT"])).unwrap();
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn parse_port_mapping_rejects_bad_spec() {
        assert!(parse_port_mapping("8080").is_err());
        assert!(parse_port_mapping("8080:80").is_ok());
    }
}
