use std::io::{self, Write};

use anyhow::Result;
use libcontainer::catalog::ContainerState;
use libcontainer::supervisor::Paths;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tabwriter::TabWriter;

use super::open_catalog;

/// Lists catalog records, reconciling each `Running` one first: a PID that
/// no longer answers `kill(pid, 0)` with anything but `EPERM` is dead, so
/// its record flips to `Stopped` before the table prints.
pub fn list(_args: libpocket_cli::List, paths: Paths) -> Result<()> {
    let catalog = open_catalog(&paths)?;

    for record in catalog.list_containers()? {
        if record.state == ContainerState::Running && !is_alive(record.pid) {
            catalog.update_container_state(&record.id, ContainerState::Stopped)?;
        }
    }

    let mut tw = TabWriter::new(io::stdout());
    writeln!(tw, "ID\tNAME\tIMAGE\tSTATE\tSTARTED\tRESTARTS")?;
    for record in catalog.list_containers()? {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}\t{}",
            record.id,
            record.name,
            record.image,
            record.state.as_str(),
            record.started_at.to_rfc3339(),
            record.restart_count,
        )?;
    }
    tw.flush()?;

    Ok(())
}

fn is_alive(pid: i64) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}
