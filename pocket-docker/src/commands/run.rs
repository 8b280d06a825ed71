use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use libcontainer::network::{self, PortMapping, SystemCommandRunner};
use libcontainer::supervisor::{self, Paths, RunRequest};
use nix::unistd::geteuid;

use super::open_catalog;

pub fn run(args: libpocket_cli::Run, paths: Paths) -> Result<()> {
    if args.interactive && args.detach {
        bail!("--interactive and --detach are mutually exclusive");
    }
    if args.tty && args.detach {
        bail!("--tty and --detach are mutually exclusive");
    }

    let mut argv = shell_words::split(&args.cmd).context("failed to parse --cmd")?;
    if argv.is_empty() {
        bail!("--cmd must not be empty");
    }
    let cmd = argv.remove(0);

    let ports: Vec<PortMapping> = args
        .publish
        .iter()
        .map(|spec| network::parse_port_mapping(spec))
        .collect::<std::result::Result<_, _>>()
        .context("invalid --publish spec")?;
    let network = args.network || !ports.is_empty();

    let (rootfs_source, image_name) = resolve_rootfs(&paths, &args.rootfs)?;

    let req = RunRequest {
        rootfs_source,
        image_name,
        cmd,
        args: argv,
        memory_bytes: args.memory,
        cpu_shares: args.cpu_shares,
        ports,
        network,
        health_cmd: args.health_cmd.unwrap_or_default(),
        health_interval: Duration::from_secs(args.health_interval.unwrap_or(30)),
        restart_max: args.restart_max.unwrap_or(0),
        detach: args.detach,
        interactive: args.interactive,
        tty: args.tty,
    };

    let runner: Arc<dyn network::CommandRunner + Send + Sync> = Arc::new(SystemCommandRunner);
    let privileged = geteuid().is_root();

    supervisor::run(req, &paths, runner, privileged)?;
    Ok(())
}

fn resolve_rootfs(paths: &Paths, rootfs: &str) -> Result<(PathBuf, String)> {
    let path = PathBuf::from(rootfs);
    if path.exists() {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| rootfs.to_string());
        return Ok((path, name));
    }

    let catalog = open_catalog(paths)?;
    let image = catalog
        .get_image(rootfs)
        .with_context(|| format!("rootfs {rootfs} is neither a path nor a pulled image"))?;
    Ok((PathBuf::from(image.path), image.name))
}
