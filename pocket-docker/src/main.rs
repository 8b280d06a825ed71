//! pocket-docker: a minimal Linux container runtime. Clones a command into
//! fresh namespaces, optionally cap it with cgroup v2 and wire it onto an
//! isolated veth network, supervise its health, and log its output.
mod commands;
mod observability;
mod rootpath;

use anyhow::Result;
use clap::Parser;
use libcontainer::supervisor::Paths;

#[derive(Parser, Debug)]
#[clap(version, author)]
struct Opts {
    /// Write logs here instead of stderr
    #[clap(long, global = true)]
    log: Option<std::path::PathBuf>,
    /// `text` (default) or `json`
    #[clap(long = "log-format", global = true)]
    log_format: Option<String>,
    /// Log level, e.g. `debug`, `info`, `warn`, `error`
    #[clap(long = "log-level", global = true)]
    log_level: Option<String>,
    /// Shorthand for `--log-level debug`
    #[clap(long, global = true)]
    debug: bool,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser, Debug)]
enum SubCommand {
    Run(libpocket_cli::Run),
    Stop(libpocket_cli::Stop),
    List(libpocket_cli::List),
    Pull(libpocket_cli::Pull),
    Logs(libpocket_cli::Logs),
    Remove(libpocket_cli::Remove),
    Exec(libpocket_cli::Exec),
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(err) = observability::init(observability::ObservabilityConfig {
        log_debug_flag: opts.debug,
        log_level: opts.log_level.clone(),
        log_file: opts.log.clone(),
        log_format: opts.log_format.clone(),
        journald: cfg!(debug_assertions),
    }) {
        eprintln!("log init failed: {err:?}");
    }

    let (home, sudo_owner) = rootpath::determine()?;
    let paths = Paths { home, sudo_owner };

    tracing::debug!(uid = %nix::unistd::geteuid(), args = ?std::env::args_os(), "started");

    match opts.subcmd {
        SubCommand::Run(args) => commands::run::run(args, paths),
        SubCommand::Stop(args) => commands::stop::stop(args, paths),
        SubCommand::List(args) => commands::list::list(args, paths),
        SubCommand::Pull(args) => commands::pull::pull(args, paths),
        SubCommand::Logs(args) => commands::logs::logs(args, paths),
        SubCommand::Remove(args) => commands::remove::remove(args, paths),
        SubCommand::Exec(args) => commands::exec::exec(args, paths),
    }
}
