//! Raw partition access.
//!
//! Backup, flash and readback verification all stream partition bytes through
//! [`PartitionStore`]. On a device this is the `by-name` block device
//! directory; tests substitute plain files or memory.

use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub trait PartitionStore: Send + Sync {
    fn exists(&self, partition: &str) -> bool;

    fn open_read(&self, partition: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Open for overwrite from offset zero.
    fn open_write(&self, partition: &str) -> io::Result<Box<dyn Write + Send>>;
}

/// Partition names are single path components of `[A-Za-z0-9_-]`.
pub fn validate_partition_name(partition: &str) -> io::Result<()> {
    let ok = !partition.is_empty()
        && partition
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid partition name {:?}", partition),
        ))
    }
}

/// Block devices under a `by-name` directory.
#[derive(Debug, Clone)]
pub struct BlockDevicePartitions {
    dir: PathBuf,
}

impl BlockDevicePartitions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, partition: &str) -> io::Result<PathBuf> {
        validate_partition_name(partition)?;
        Ok(self.dir.join(partition))
    }
}

impl PartitionStore for BlockDevicePartitions {
    fn exists(&self, partition: &str) -> bool {
        self.path(partition).map(|p| p.exists()).unwrap_or(false)
    }

    fn open_read(&self, partition: &str) -> io::Result<Box<dyn Read + Send>> {
        let file = std::fs::File::open(self.path(partition)?)?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn open_write(&self, partition: &str) -> io::Result<Box<dyn Write + Send>> {
        let path = self.path(partition)?;
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such partition: {}", path.display()),
            ));
        }
        let file = OpenOptions::new().write(true).open(&path)?;
        // Regular files (images, tests) are truncated; block devices keep their size.
        if file.metadata()?.is_file() {
            file.set_len(0)?;
        }
        Ok(Box::new(SyncingWriter { file }))
    }
}

/// Flushes to the device on `flush`.
struct SyncingWriter {
    file: std::fs::File,
}

impl Write for SyncingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

/// Stream `reader` into SHA-256, optionally stopping after `limit` bytes.
/// Returns the byte count and the hex digest.
pub fn hash_reader(
    mut reader: impl Read,
    limit: Option<u64>,
    buffer_bytes: usize,
) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; buffer_bytes.max(4096)];
    let mut total = 0u64;
    loop {
        let want = match limit {
            Some(limit) if total >= limit => break,
            Some(limit) => buf.len().min((limit - total) as usize),
            None => buf.len(),
        };
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}

/// Copy `reader` into `writer`, hashing the bytes on the way through.
///
/// `on_chunk` sees the running byte count after every chunk.
pub fn copy_hashed(
    mut reader: impl Read,
    writer: &mut dyn Write,
    buffer_bytes: usize,
    on_chunk: &mut dyn FnMut(u64),
) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; buffer_bytes.max(4096)];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        total += n as u64;
        on_chunk(total);
    }
    writer.flush()?;
    Ok((total, hex::encode(hasher.finalize())))
}

/// SHA-256 of a file on disk.
pub fn hash_file(path: &Path, buffer_bytes: usize) -> io::Result<(u64, String)> {
    let file = std::fs::File::open(path)?;
    hash_reader(io::BufReader::new(file), None, buffer_bytes)
}
