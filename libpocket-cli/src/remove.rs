use clap::Parser;

/// Delete a container's catalog record (does not touch a running process)
#[derive(Parser, Debug)]
pub struct Remove {
    /// Container id to remove
    pub container_id: Option<String>,
    /// Remove every record in the catalog
    #[clap(long)]
    pub all: bool,
}
