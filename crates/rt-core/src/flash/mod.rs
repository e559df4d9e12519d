//! Image download and partition flashing.
//!
//! Downloads are resumable by byte offset with a checksummed trailing window.
//! Flashing streams a verified image into one partition and is not
//! interruptible once the first byte is written.

mod download;
mod image;
mod source;

pub use download::{Checkpoint, DownloadReport};
pub use image::ImageFile;
#[cfg(feature = "http")]
pub use source::HttpSource;
pub use source::{FileSource, ImageSource};

use crate::cancel::CancellationToken;
use crate::events::ProgressSink;
use crate::partition::{copy_hashed, PartitionStore};
use rt_config::DownloadPolicy;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("image {} changed after verification", path.display())]
    ImageChanged { path: PathBuf },

    #[error("checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("image source error: {0}")]
    Source(String),

    #[error("download cancelled after {bytes} bytes")]
    Cancelled { bytes: u64 },

    #[error("another download to {} is in progress", dest.display())]
    DownloadBusy { dest: PathBuf },

    #[error("partition {partition} is not writable: {source}")]
    PartitionUnavailable {
        partition: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<FlashError> for rt_common::Error {
    fn from(err: FlashError) -> Self {
        match err {
            FlashError::InvalidImage(msg) => rt_common::Error::InvalidImage(msg),
            FlashError::ImageChanged { path } => rt_common::Error::InvalidImage(format!(
                "{} changed after verification",
                path.display()
            )),
            FlashError::ChecksumMismatch {
                subject,
                expected,
                actual,
            } => rt_common::Error::ChecksumMismatch {
                subject,
                expected,
                actual,
            },
            FlashError::Source(msg) => rt_common::Error::Io(io::Error::other(msg)),
            FlashError::Cancelled { .. } => rt_common::Error::Cancelled {
                stage: "download".to_string(),
            },
            FlashError::DownloadBusy { .. } => rt_common::Error::ConcurrentOperation,
            FlashError::PartitionUnavailable { source, .. } => rt_common::Error::Io(source),
            FlashError::Io(e) => rt_common::Error::Io(e),
            FlashError::Json(e) => rt_common::Error::Json(e),
        }
    }
}

/// Result of writing one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashReport {
    pub partition: String,
    pub bytes_written: u64,
    pub sha256: String,
}

pub struct FlashManager {
    partitions: Arc<dyn PartitionStore>,
    policy: DownloadPolicy,
    buffer_bytes: usize,
}

impl FlashManager {
    pub fn new(
        partitions: Arc<dyn PartitionStore>,
        policy: DownloadPolicy,
        buffer_bytes: usize,
    ) -> Self {
        Self {
            partitions,
            policy,
            buffer_bytes,
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Fetch `source` into `dest`, resuming from a previous checkpoint when
    /// one is present. Cancellation is honoured between chunks.
    pub fn download(
        &self,
        source: &dyn ImageSource,
        dest: &Path,
        expected_sha256: Option<&str>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, FlashError> {
        download::run(source, dest, expected_sha256, &self.policy, sink, cancel)
    }

    /// Write `image` to `partition` from offset zero.
    ///
    /// `progress` receives `(written, total)` after every chunk. There is no
    /// cancellation point once writing starts.
    pub fn flash(
        &self,
        image: &ImageFile,
        partition: &str,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<FlashReport, FlashError> {
        if !self.partitions.exists(partition) {
            return Err(FlashError::PartitionUnavailable {
                partition: partition.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such partition"),
            });
        }
        let file = File::open(&image.path)?;
        if file.metadata()?.len() != image.size_bytes {
            return Err(FlashError::ImageChanged {
                path: image.path.clone(),
            });
        }
        let mut writer = self.partitions.open_write(partition).map_err(|source| {
            FlashError::PartitionUnavailable {
                partition: partition.to_string(),
                source,
            }
        })?;

        info!(partition, image = %image.path.display(), size_bytes = image.size_bytes, "flashing");
        let total = image.size_bytes;
        let (written, sha256) = copy_hashed(
            BufReader::new(file),
            &mut writer,
            self.buffer_bytes,
            &mut |done| progress(done, total),
        )?;
        writer.flush()?;
        drop(writer);

        if written != image.size_bytes {
            warn!(partition, written, expected = image.size_bytes, "short write");
            return Err(FlashError::ImageChanged {
                path: image.path.clone(),
            });
        }
        if let Some(expected) = &image.expected_sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                return Err(FlashError::ImageChanged {
                    path: image.path.clone(),
                });
            }
        }
        Ok(FlashReport {
            partition: partition.to_string(),
            bytes_written: written,
            sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryPartitions;

    fn manager(parts: Arc<MemoryPartitions>) -> FlashManager {
        FlashManager::new(parts, DownloadPolicy::default(), 4096)
    }

    #[test]
    fn test_flash_writes_image_and_reports_progress() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("recovery.img");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let parts = Arc::new(MemoryPartitions::new());
        parts.insert("recovery", b"old".to_vec());
        let image = ImageFile::inspect(&path, None).unwrap();

        let mut seen = Vec::new();
        let report = manager(parts.clone())
            .flash(&image, "recovery", &mut |done, total| seen.push((done, total)))
            .unwrap();
        assert_eq!(report.bytes_written, 10_000);
        assert_eq!(parts.get("recovery").unwrap(), data);
        assert_eq!(seen.last(), Some(&(10_000, 10_000)));
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_flash_unknown_partition() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("boot.img");
        std::fs::write(&path, b"img").unwrap();
        let image = ImageFile::inspect(&path, None).unwrap();
        let err = manager(Arc::new(MemoryPartitions::new()))
            .flash(&image, "boot", &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, FlashError::PartitionUnavailable { .. }));
    }

    #[test]
    fn test_flash_detects_image_swapped_after_inspection() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("boot.img");
        std::fs::write(&path, b"abc").unwrap();
        let image = ImageFile::inspect(&path, None).unwrap();
        std::fs::write(&path, b"abcdef").unwrap();

        let parts = Arc::new(MemoryPartitions::new());
        parts.insert("boot", b"orig".to_vec());
        let err = manager(parts.clone())
            .flash(&image, "boot", &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, FlashError::ImageChanged { .. }));
        assert_eq!(parts.get("boot").unwrap(), b"orig");
    }
}
