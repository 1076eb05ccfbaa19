//! Raw block I/O on the marker file.
//!
//! Block indices are relative to the start of the marker file, so block
//! `i` is the i-th protocol slot. `open` takes an exclusive advisory lock
//! that is held until `close`, so only one process drives a device at a time.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rustix::fs::{FlockOperation, Mode, OFlags};
use tracing::{debug, warn};

use se3_core::config::TransportConfig;
use se3_core::wire::BLOCK_SIZE;
use se3_core::{Se3Result, TransportError};

/// Alignment required for O_DIRECT buffers and offsets.
const DIRECT_ALIGN: usize = 4096;

/// Block read/write capability consumed by the tunnel.
pub trait BlockTransport {
    /// Acquire exclusive access, waiting at most until `deadline`.
    fn open(&mut self, deadline: Instant) -> Se3Result<()>;

    /// Read `buf.len() / 512` consecutive blocks starting at `block`.
    fn read(&mut self, block: usize, buf: &mut [u8]) -> Se3Result<()>;

    /// Write `buf.len() / 512` consecutive blocks starting at `block`.
    fn write(&mut self, block: usize, buf: &[u8]) -> Se3Result<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

fn check_block_buf(len: usize) -> Se3Result<()> {
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(TransportError::Malformed(format!(
            "buffer of {len} bytes is not a whole number of blocks"
        ))
        .into());
    }
    Ok(())
}

/// Heap buffer whose payload starts on a `DIRECT_ALIGN` boundary.
struct AlignedBuf {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuf {
    fn new(len: usize) -> Self {
        let raw = vec![0u8; len + DIRECT_ALIGN];
        let offset = raw.as_ptr().align_offset(DIRECT_ALIGN);
        Self { raw, offset, len }
    }

    fn as_slice(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }
}

/// `BlockTransport` over a marker file on a mounted volume.
#[derive(Debug)]
pub struct FileTransport {
    path: PathBuf,
    direct_io: bool,
    poll_interval: Duration,
    file: Option<File>,
    /// Whether the open handle actually bypasses the page cache
    direct: bool,
}

impl FileTransport {
    pub fn new(path: impl Into<PathBuf>, config: &TransportConfig) -> Self {
        Self {
            path: path.into(),
            direct_io: config.direct_io,
            poll_interval: config.poll_interval(),
            file: None,
            direct: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(&self) -> Se3Result<(File, bool)> {
        let base = OFlags::RDWR | OFlags::CLOEXEC;
        if self.direct_io {
            match rustix::fs::open(self.path.as_path(), base | OFlags::DIRECT, Mode::empty()) {
                Ok(fd) => return Ok((File::from(fd), true)),
                // tmpfs and some FUSE mounts refuse O_DIRECT
                Err(rustix::io::Errno::INVAL) => {
                    warn!(path = %self.path.display(), "O_DIRECT unsupported, using buffered I/O");
                }
                Err(rustix::io::Errno::NOENT) => {
                    return Err(TransportError::NotFound(self.path.display().to_string()).into())
                }
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }
        match rustix::fs::open(self.path.as_path(), base, Mode::empty()) {
            Ok(fd) => Ok((File::from(fd), false)),
            Err(rustix::io::Errno::NOENT) => {
                Err(TransportError::NotFound(self.path.display().to_string()).into())
            }
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    fn file(&self) -> Se3Result<&File> {
        self.file.as_ref().ok_or_else(|| TransportError::Closed.into())
    }
}

impl BlockTransport for FileTransport {
    fn open(&mut self, deadline: Instant) -> Se3Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let (file, direct) = self.open_file()?;
        loop {
            match rustix::fs::flock(&file, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => break,
                Err(rustix::io::Errno::WOULDBLOCK) => {
                    if Instant::now() >= deadline {
                        debug!(path = %self.path.display(), "lock wait timed out");
                        return Err(TransportError::Locked.into());
                    }
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }
        debug!(path = %self.path.display(), direct, "block device opened");
        self.file = Some(file);
        self.direct = direct;
        Ok(())
    }

    fn read(&mut self, block: usize, buf: &mut [u8]) -> Se3Result<()> {
        check_block_buf(buf.len())?;
        let file = self.file()?;
        let offset = (block * BLOCK_SIZE) as u64;
        if self.direct {
            let mut aligned = AlignedBuf::new(buf.len());
            file.read_exact_at(aligned.as_mut_slice(), offset)?;
            buf.copy_from_slice(aligned.as_slice());
        } else {
            file.read_exact_at(buf, offset)?;
        }
        Ok(())
    }

    fn write(&mut self, block: usize, buf: &[u8]) -> Se3Result<()> {
        check_block_buf(buf.len())?;
        let file = self.file()?;
        let offset = (block * BLOCK_SIZE) as u64;
        if self.direct {
            let mut aligned = AlignedBuf::new(buf.len());
            aligned.as_mut_slice().copy_from_slice(buf);
            file.write_all_at(aligned.as_slice(), offset)?;
        } else {
            file.write_all_at(buf, offset)?;
            file.sync_data()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the descriptor releases the flock
        if self.file.take().is_some() {
            debug!(path = %self.path.display(), "block device closed");
        }
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for FileTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use se3_core::Se3Error;

    fn marker(dir: &Path) -> PathBuf {
        let path = dir.join(".se3magic");
        std::fs::write(&path, vec![0u8; 16 * BLOCK_SIZE]).unwrap();
        path
    }

    fn buffered() -> TransportConfig {
        TransportConfig {
            direct_io: false,
            poll_interval_ms: 1,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_aligned_buf() {
        let mut buf = AlignedBuf::new(1024);
        assert_eq!(buf.as_slice().as_ptr() as usize % DIRECT_ALIGN, 0);
        buf.as_mut_slice()[1023] = 9;
        assert_eq!(buf.as_slice().len(), 1024);
    }

    #[test]
    fn test_read_write_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = FileTransport::new(marker(dir.path()), &buffered());
        t.open(Instant::now()).unwrap();

        let data = vec![0x5Au8; 2 * BLOCK_SIZE];
        t.write(3, &data).unwrap();
        let mut back = vec![0u8; 2 * BLOCK_SIZE];
        t.read(3, &mut back).unwrap();
        assert_eq!(back, data);

        let on_disk = std::fs::read(t.path()).unwrap();
        assert_eq!(&on_disk[3 * BLOCK_SIZE..5 * BLOCK_SIZE], &data[..]);
    }

    #[test]
    fn test_partial_block_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = FileTransport::new(marker(dir.path()), &buffered());
        t.open(Instant::now()).unwrap();
        assert!(matches!(
            t.write(0, &[0u8; 100]),
            Err(Se3Error::Transport(TransportError::Malformed(_)))
        ));
    }

    #[test]
    fn test_closed_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = FileTransport::new(marker(dir.path()), &buffered());
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            t.read(0, &mut buf),
            Err(Se3Error::Transport(TransportError::Closed))
        ));
        t.open(Instant::now()).unwrap();
        t.close();
        assert!(!t.is_open());
        assert!(t.read(0, &mut buf).is_err());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = FileTransport::new(dir.path().join("absent"), &buffered());
        assert!(matches!(
            t.open(Instant::now()),
            Err(Se3Error::Transport(TransportError::NotFound(_)))
        ));
    }
}
