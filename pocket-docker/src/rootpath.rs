//! Resolves the home directory `pocket-docker` persists its catalog, logs,
//! and pulled images under. When invoked via `sudo`, records must land in
//! the real user's home rather than root's so that a later unprivileged
//! invocation can still read them.

use std::path::PathBuf;

use nix::unistd::{Gid, Uid, User};

/// Resolves the invoking user's home directory, and, when running under
/// `sudo`, the `(uid, gid)` that `logs`/catalog files should be chowned to
/// so the original, unprivileged user can still read them.
pub fn determine() -> anyhow::Result<(PathBuf, Option<(Uid, Gid)>)> {
    if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        if let Some(user) = User::from_name(&sudo_user).ok().flatten() {
            return Ok((user.dir, Some((user.uid, user.gid))));
        }
    }

    let home = std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| fallback_home(Uid::effective()));
    Ok((home, None))
}

fn fallback_home(uid: Uid) -> PathBuf {
    User::from_uid(uid)
        .ok()
        .flatten()
        .map(|user| user.dir)
        .unwrap_or_else(|| PathBuf::from("/root"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn uses_home_env_var_when_not_under_sudo() {
        std::env::remove_var("SUDO_USER");
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", tmp.path());
        let (home, sudo_owner) = determine().unwrap();
        assert_eq!(home, tmp.path());
        assert!(sudo_owner.is_none());
        std::env::remove_var("HOME");
    }
}
