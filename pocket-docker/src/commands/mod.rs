use anyhow::{Context, Result};
use libcontainer::catalog::Catalog;
use libcontainer::supervisor::Paths;

pub mod exec;
pub mod list;
pub mod logs;
pub mod pull;
pub mod remove;
pub mod run;
pub mod stop;

pub fn open_catalog(paths: &Paths) -> Result<Catalog> {
    let db_path = paths.state_db();
    Catalog::open(&db_path)
        .with_context(|| format!("failed to open catalog at {}", db_path.display()))
}
