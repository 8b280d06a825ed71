use std::io::Read;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use libcontainer::catalog::ImageRecord;
use libcontainer::supervisor::Paths;
use sha2::{Digest, Sha256};

use super::open_catalog;

/// Extracts the local rootfs archive at `src` into
/// `$HOME/.pocket-docker/images/<name>/` and registers it in the catalog.
pub fn pull(args: libpocket_cli::Pull, paths: Paths) -> Result<()> {
    let src = PathBuf::from(&args.src);
    if !src.is_file() {
        bail!("pull source {} is not a readable file", src.display());
    }

    if let Some(expected) = &args.sha256 {
        verify_sha256(&src, expected)?;
    }

    let name = args
        .name
        .unwrap_or_else(|| src.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default());
    if name.is_empty() {
        bail!("could not derive an image name from {}", src.display());
    }

    let dest = paths.images_dir().join(&name);
    std::fs::create_dir_all(&dest)
        .with_context(|| format!("failed to create image directory {}", dest.display()))?;

    let status = Command::new("tar")
        .arg("-xf")
        .arg(&src)
        .arg("-C")
        .arg(&dest)
        .status()
        .context("failed to spawn tar")?;
    if !status.success() {
        bail!("tar extraction of {} exited with {status}", src.display());
    }

    let catalog = open_catalog(&paths)?;
    catalog.save_image(&ImageRecord {
        name: name.clone(),
        path: dest.to_string_lossy().to_string(),
        created_at: Utc::now(),
    })?;

    println!("{name}");
    Ok(())
}

fn verify_sha256(path: &std::path::Path, expected: &str) -> Result<()> {
    let mut file = std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hex::encode(hasher.finalize());
    if !digest.eq_ignore_ascii_case(expected) {
        bail!("sha256 mismatch: expected {expected}, got {digest}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_mismatch_is_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"hello").unwrap();
        let err = verify_sha256(tmp.path(), "0000000000000000000000000000000000000000000000000000000000000000").unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn sha256_match_is_accepted() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"hello").unwrap();
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(b"hello");
            hex::encode(hasher.finalize())
        };
        verify_sha256(tmp.path(), &digest).unwrap();
    }
}
