use anyhow::Result;
use libcontainer::context::CancelToken;
use libcontainer::logs;
use libcontainer::supervisor::Paths;

use super::open_catalog;

pub fn logs(args: libpocket_cli::Logs, paths: Paths) -> Result<()> {
    // touch the catalog only to validate the id exists
    open_catalog(&paths)?.get_container(&args.container_id)?;

    let mut stdout = std::io::stdout();
    if !args.follow {
        logs::cat(&paths.home, &args.container_id, &mut stdout)?;
        return Ok(());
    }

    let path = logs::log_path(&paths.home, &args.container_id);
    let tail = logs::last_lines(&path, args.tail)?;
    std::io::Write::write_all(&mut stdout, &tail)?;

    let cancel = CancelToken::new();
    register_sigint(cancel.clone());
    logs::follow(&path, stdout, &cancel)?;
    Ok(())
}

fn register_sigint(cancel: CancelToken) {
    // best-effort: a plain Ctrl-C during `logs -f` should stop the poller
    // promptly instead of relying on process exit to reclaim the thread.
    let _ = ctrlc::set_handler(move || cancel.cancel());
}
