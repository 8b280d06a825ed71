use anyhow::{bail, Result};
use libcontainer::supervisor::Paths;

use super::open_catalog;

/// Deletes catalog records only; does not touch a still-running process
/// (use `stop` first).
pub fn remove(args: libpocket_cli::Remove, paths: Paths) -> Result<()> {
    let catalog = open_catalog(&paths)?;

    let ids: Vec<String> = if args.all {
        catalog.list_containers()?.into_iter().map(|r| r.id).collect()
    } else {
        let id = args
            .container_id
            .ok_or_else(|| anyhow::anyhow!("requires a container id or --all"))?;
        vec![id]
    };

    if ids.is_empty() {
        bail!("no containers to remove");
    }

    for id in ids {
        catalog.delete_container(&id)?;
        println!("{id}");
    }

    Ok(())
}
