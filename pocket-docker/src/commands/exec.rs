use anyhow::{bail, Result};
use libcontainer::catalog::ContainerState;
use libcontainer::network::SystemCommandRunner;
use libcontainer::supervisor::Paths;
use nix::unistd::Pid;

use super::open_catalog;

/// Reconciles the target record, refuses if it isn't `Running`, and joins
/// its namespaces. Propagates the child's exit code as this process's own.
pub fn exec(args: libpocket_cli::Exec, paths: Paths) -> Result<()> {
    let catalog = open_catalog(&paths)?;
    let record = catalog.get_container(&args.container_id)?;
    if record.state != ContainerState::Running {
        bail!("container {} is not running", args.container_id);
    }

    let pid = Pid::from_raw(record.pid as i32);
    let runner = SystemCommandRunner;
    let code = libcontainer::exec::exec_in(&runner, pid, &args.cmd, args.interactive, args.tty)?;
    std::process::exit(code);
}
