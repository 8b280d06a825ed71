use anyhow::{bail, Result};
use libcontainer::catalog::{ContainerRecord, ContainerState};
use libcontainer::network::SystemCommandRunner;
use libcontainer::supervisor::Paths;

use super::open_catalog;

pub fn stop(args: libpocket_cli::Stop, paths: Paths) -> Result<()> {
    let catalog = open_catalog(&paths)?;

    let targets: Vec<ContainerRecord> = if args.all {
        catalog
            .list_containers()?
            .into_iter()
            .filter(|r| r.state == ContainerState::Running)
            .collect()
    } else {
        let id = args
            .container_id
            .ok_or_else(|| anyhow::anyhow!("requires a container id or --all"))?;
        vec![catalog.get_container(&id)?]
    };

    if targets.is_empty() {
        bail!("no running containers to stop");
    }

    let runner = SystemCommandRunner;
    for record in &targets {
        libcontainer::cleanup::run(record, &runner);
        catalog.update_container_state(&record.id, ContainerState::Stopped)?;
        println!("{}", record.id);
    }

    Ok(())
}
