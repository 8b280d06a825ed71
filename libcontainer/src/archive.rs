//! Rootfs extraction: turns a `--rootfs` source (a tar archive or a plain
//! directory) into a fresh, owned temp directory the isolation primitive
//! can pivot/chroot into. Delegates to the external `tar` binary rather
//! than an in-process archive reader, the same way the network fabric
//! shells out to `ip` instead of using a netlink crate.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to create temp rootfs directory under {0}: {1}")]
    CreateTempDir(PathBuf, std::io::Error),
    #[error("tar extraction of {0:?} failed: {1}")]
    Extract(PathBuf, std::io::Error),
    #[error("tar extraction of {0:?} exited with status {1}")]
    ExtractStatus(PathBuf, std::process::ExitStatus),
    #[error("directory copy from {0:?} failed: {1}")]
    Copy(PathBuf, std::io::Error),
    #[error("source {0:?} is neither a readable archive nor a directory")]
    UnreadableSource(PathBuf),
}

type Result<T> = std::result::Result<T, ArchiveError>;

/// Extracts or copies `source` (an archive file or a directory) into a
/// fresh `<runs_dir>/<id>` directory and returns its path.
pub fn materialize_rootfs(runs_dir: &Path, id: &str, source: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(runs_dir).map_err(|err| ArchiveError::CreateTempDir(runs_dir.to_path_buf(), err))?;
    let dest = runs_dir.join(id);
    std::fs::create_dir_all(&dest).map_err(|err| ArchiveError::CreateTempDir(dest.clone(), err))?;

    if source.is_dir() {
        copy_directory(source, &dest)?;
    } else if source.is_file() {
        extract_archive(source, &dest)?;
    } else {
        return Err(ArchiveError::UnreadableSource(source.to_path_buf()));
    }

    Ok(dest)
}

fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let status = Command::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .status()
        .map_err(|err| ArchiveError::Extract(archive.to_path_buf(), err))?;
    if !status.success() {
        return Err(ArchiveError::ExtractStatus(archive.to_path_buf(), status));
    }
    Ok(())
}

/// `tar -C src -cf - . | tar -C dst -xf -`: preserves modes/ownership the
/// way a plain `cp -r` would not guarantee across all filesystems.
fn copy_directory(src: &Path, dest: &Path) -> Result<()> {
    let mut producer = Command::new("tar")
        .arg("-C")
        .arg(src)
        .args(["-cf", "-", "."])
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|err| ArchiveError::Copy(src.to_path_buf(), err))?;

    let producer_stdout = producer
        .stdout
        .take()
        .ok_or_else(|| {
            ArchiveError::Copy(
                src.to_path_buf(),
                std::io::Error::new(std::io::ErrorKind::Other, "no stdout"),
            )
        })?;

    let consumer_status = Command::new("tar")
        .arg("-C")
        .arg(dest)
        .args(["-xf", "-"])
        .stdin(Stdio::from(producer_stdout))
        .status()
        .map_err(|err| ArchiveError::Copy(src.to_path_buf(), err))?;

    let producer_status = producer
        .wait()
        .map_err(|err| ArchiveError::Copy(src.to_path_buf(), err))?;

    if !producer_status.success() {
        return Err(ArchiveError::ExtractStatus(src.to_path_buf(), producer_status));
    }
    if !consumer_status.success() {
        return Err(ArchiveError::ExtractStatus(dest.to_path_buf(), consumer_status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn materialize_rejects_missing_source() {
        let tmp = TempDir::new().unwrap();
        let err = materialize_rootfs(tmp.path(), "abc", &tmp.path().join("nope"));
        assert!(err.is_err());
    }

    #[test]
    fn materialize_copies_directory_source() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("bin")).unwrap();
        std::fs::write(src.join("bin").join("sh"), b"#!/bin/sh\n").unwrap();

        let runs_dir = tmp.path().join("runs");
        let dest = materialize_rootfs(&runs_dir, "ctn1", &src).unwrap();
        assert!(dest.join("bin").join("sh").exists());
    }
}
