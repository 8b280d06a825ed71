use clap::Parser;

/// Create a container and immediately start it
#[derive(Parser, Debug)]
pub struct Run {
    /// Path to a rootfs archive/directory, or the name of a previously
    /// `pull`ed image
    #[clap(long, required = true)]
    pub rootfs: String,
    /// Shell-quoted command to run as the container's entrypoint
    #[clap(long, required = true)]
    pub cmd: String,
    /// Memory limit in bytes (applies `memory.max` via the cgroup v2
    /// controller)
    #[clap(long)]
    pub memory: Option<i64>,
    /// Relative CPU weight (applies `cpu.weight`)
    #[clap(long = "cpu-shares")]
    pub cpu_shares: Option<u64>,
    /// Publish a host:container TCP port, e.g. `-p 8080:80`; may be given
    /// more than once
    #[clap(short = 'p', long = "publish")]
    pub publish: Vec<String>,
    /// Set up the veth/NAT network fabric (implied by any `--publish`)
    #[clap(long)]
    pub network: bool,
    /// Command run by the watchdog to determine liveness; PID liveness is
    /// used when omitted
    #[clap(long = "health-cmd")]
    pub health_cmd: Option<String>,
    /// Watchdog polling interval in seconds (minimum effective value is 30)
    #[clap(long = "health-interval")]
    pub health_interval: Option<u64>,
    /// 0 = never restart, -1 = unlimited, n>0 = bounded
    #[clap(long = "restart-max")]
    pub restart_max: Option<i64>,
    /// Run detached: print the id and return immediately
    #[clap(short, long)]
    pub detach: bool,
    /// Keep stdin open
    #[clap(short, long)]
    pub interactive: bool,
    /// Allocate a pseudo-terminal for the container
    #[clap(short, long)]
    pub tty: bool,
}
