//! The per-container log pipeline: a tee thread that appends every byte
//! from a child's stdio source to a log file while also streaming it to a
//! live reader, stripping carriage returns along the way.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe, Gid, Uid};

use crate::context::CancelToken;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to create log directory {0}: {1}")]
    CreateDir(PathBuf, io::Error),
    #[error("failed to open log file {0}: {1}")]
    OpenFile(PathBuf, io::Error),
    #[error("failed to chown {0}: {1}")]
    Chown(PathBuf, nix::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, LogError>;

pub fn log_dir(home: &Path) -> PathBuf {
    home.join(".pocket-docker").join("logs")
}

pub fn log_path(home: &Path, id: &str) -> PathBuf {
    log_dir(home).join(format!("{id}.log"))
}

fn open_log_file(home: &Path, id: &str, sudo_owner: Option<(Uid, Gid)>) -> Result<File> {
    let dir = log_dir(home);
    std::fs::create_dir_all(&dir).map_err(|err| LogError::CreateDir(dir.clone(), err))?;
    if let Some((uid, gid)) = sudo_owner {
        nix::unistd::chown(&dir, Some(uid), Some(gid)).map_err(|err| LogError::Chown(dir.clone(), err))?;
    }

    let path = log_path(home, id);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(&path)
        .map_err(|err| LogError::OpenFile(path.clone(), err))?;
    if let Some((uid, gid)) = sudo_owner {
        nix::unistd::chown(&path, Some(uid), Some(gid)).map_err(|err| LogError::Chown(path.clone(), err))?;
    }
    Ok(file)
}

/// How long (ms) a single `poll` waits for `source` to become readable
/// before looping back to recheck `cancel`; this bounds how long a
/// cancellation can be stuck behind a blocked read.
const TEE_POLL_INTERVAL_MS: u16 = 200;

/// Tees `source` into `$HOME/.pocket-docker/logs/<id>.log` and a live
/// reader, until `source` hits EOF/error or `cancel` is triggered. The
/// read is polled rather than called directly so a source with no
/// pending data (a PTY master with nothing written to it) doesn't block
/// past `cancel` firing. Returns the reader end a caller can copy to
/// stdout.
pub fn attach_cancelable<R: Read + AsRawFd + Send + 'static>(
    home: &Path,
    id: &str,
    mut source: R,
    sudo_owner: Option<(Uid, Gid)>,
    cancel: CancelToken,
) -> Result<File> {
    let mut log_file = open_log_file(home, id, sudo_owner)?;
    let (read_fd, write_fd) = pipe().map_err(|err| LogError::Io(io::Error::from(err)))?;
    let reader: File = unsafe { File::from_raw_fd(owned_into_raw(read_fd)) };
    let mut writer: File = unsafe { File::from_raw_fd(owned_into_raw(write_fd)) };

    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let borrowed = unsafe { BorrowedFd::borrow_raw(source.as_raw_fd()) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(TEE_POLL_INTERVAL_MS)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::Error::EINTR) => continue,
                Err(_) => break,
            }

            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let stripped: Vec<u8> = buf[..n].iter().copied().filter(|&b| b != b'\r').collect();
                    if log_file.write_all(&stripped).is_err() {
                        break;
                    }
                    if writer.write_all(&stripped).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });

    Ok(reader)
}

fn owned_into_raw(fd: OwnedFd) -> std::os::fd::RawFd {
    use std::os::fd::IntoRawFd;
    fd.into_raw_fd()
}

/// Writes a single supervisory line (`Restart #3 ...`, `FAILED
/// health-check`) with an LF terminator.
pub fn append(home: &Path, id: &str, line: &str) -> Result<()> {
    let mut file = open_log_file(home, id, None)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Prints the full persisted log to `out` (the non-follow path of
/// `logs`).
pub fn cat(home: &Path, id: &str, out: &mut impl Write) -> Result<()> {
    let path = log_path(home, id);
    let mut file = File::open(&path).map_err(|err| LogError::OpenFile(path.clone(), err))?;
    io::copy(&mut file, out)?;
    Ok(())
}

/// Returns the last `n` lines of the file (chunked reverse scan until
/// `n+1` newlines are seen, or the start of the file).
pub fn last_lines(path: &Path, n: usize) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|err| LogError::OpenFile(path.to_path_buf(), err))?;
    let len = file.metadata()?.len();
    const CHUNK: u64 = 4096;

    let mut pos = len;
    let mut newlines = 0usize;
    let mut buf = Vec::new();

    while pos > 0 && newlines <= n {
        let read_size = CHUNK.min(pos);
        pos -= read_size;
        file.seek_read_at(pos, read_size as usize, &mut buf)?;
        newlines = buf.iter().filter(|&&b| b == b'\n').count();
    }

    let mut content = buf;
    // Trim leading bytes up to and including the (n+1)-th newline from the
    // end, leaving the trailing `n` lines.
    let mut seen = 0usize;
    let mut cut = 0usize;
    for (i, &b) in content.iter().enumerate().rev() {
        if b == b'\n' {
            seen += 1;
            if seen == n + 1 {
                cut = i + 1;
                break;
            }
        }
    }
    content.drain(..cut);
    Ok(content)
}

trait SeekReadAt {
    fn seek_read_at(&mut self, pos: u64, size: usize, out: &mut Vec<u8>) -> io::Result<()>;
}

impl SeekReadAt for File {
    fn seek_read_at(&mut self, pos: u64, size: usize, out: &mut Vec<u8>) -> io::Result<()> {
        use std::io::{Seek, SeekFrom};
        self.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; size];
        self.read_exact(&mut chunk)?;
        chunk.extend(std::mem::take(out));
        *out = chunk;
        Ok(())
    }
}

/// Polls the file for appended bytes, starting at its current length,
/// with exponential backoff from 50ms to 1s (reset on every successful
/// read), writing new bytes to `out` until `cancel` fires.
pub fn follow(path: &Path, mut out: impl Write, cancel: &CancelToken) -> Result<()> {
    let mut offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let mut backoff = Duration::from_millis(50);
    const MAX_BACKOFF: Duration = Duration::from_secs(1);

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(_) => {
                if cancel.sleep(backoff) {
                    return Ok(());
                }
                continue;
            }
        };
        use std::io::{Seek, SeekFrom};
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        let n = file.read_to_end(&mut buf)?;
        if n > 0 {
            out.write_all(&buf)?;
            offset += n as u64;
            backoff = Duration::from_millis(50);
            continue;
        }
        if cancel.sleep(backoff) {
            return Ok(());
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cr_is_stripped_from_tee_output() {
        let tmp = TempDir::new().unwrap();
        let (source, mut writer) = crate::pipe::Pipe::new().unwrap().split();
        std::io::Write::write_all(&mut writer, b"hi\r\nthere\r\n").unwrap();
        drop(writer);

        let cancel = CancelToken::new();
        let mut reader = attach_cancelable(tmp.path(), "abc", source, None, cancel).unwrap();
        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"hi\nthere\n");

        let logged = std::fs::read(log_path(tmp.path(), "abc")).unwrap();
        assert_eq!(logged, b"hi\nthere\n");
    }

    #[test]
    fn cancel_unblocks_a_source_with_no_pending_data() {
        let tmp = TempDir::new().unwrap();
        let (source, writer) = crate::pipe::Pipe::new().unwrap().split();
        let cancel = CancelToken::new();
        let mut reader = attach_cancelable(tmp.path(), "stuck", source, None, cancel.clone()).unwrap();

        // Nothing is ever written, so without the poll-before-read fix the
        // tee thread would block on `read` forever.
        cancel.cancel();
        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"");
        drop(writer);
    }

    #[test]
    fn cat_copies_file_byte_for_byte() {
        let tmp = TempDir::new().unwrap();
        append(tmp.path(), "abc", "hi").unwrap();
        let mut out = Vec::new();
        cat(tmp.path(), "abc", &mut out).unwrap();
        assert_eq!(out, b"hi\n");
    }

    #[test]
    fn last_lines_returns_tail_of_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.log");
        std::fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();
        let tail = last_lines(&path, 2).unwrap();
        assert_eq!(String::from_utf8(tail).unwrap(), "three\nfour\n");
    }
}
