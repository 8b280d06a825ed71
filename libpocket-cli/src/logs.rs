use clap::Parser;

/// Print a container's persisted log output
#[derive(Parser, Debug)]
pub struct Logs {
    /// Container id
    pub container_id: String,
    /// Follow the log as it grows
    #[clap(short, long)]
    pub follow: bool,
    /// Number of trailing lines to emit before following
    #[clap(long, default_value = "10")]
    pub tail: usize,
}
