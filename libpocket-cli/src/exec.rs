use clap::Parser;

/// Run an additional command inside a running container's namespaces
#[derive(Parser, Debug)]
pub struct Exec {
    /// Container id
    pub container_id: String,
    /// Command and arguments to run
    #[clap(required = true, num_args = 1..)]
    pub cmd: Vec<String>,
    /// Keep stdin open
    #[clap(short, long)]
    pub interactive: bool,
    /// Allocate a pseudo-terminal
    #[clap(short, long)]
    pub tty: bool,
}
