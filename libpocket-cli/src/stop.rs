use clap::Parser;

/// Stop a running container
#[derive(Parser, Debug)]
pub struct Stop {
    /// Container id to stop
    pub container_id: Option<String>,
    /// Stop every Running container in the catalog
    #[clap(long)]
    pub all: bool,
}
