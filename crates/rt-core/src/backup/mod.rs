//! Partition backups.
//!
//! A backup is a directory `<backup_root>/<name>/` holding one
//! `<partition>.img` per captured partition and a `manifest.json`. Backups
//! are append-only: a name is written once and never overwritten.

mod manifest;
mod store;

pub use manifest::{aggregate_checksum, BackupManifest, PartitionEntry, MANIFEST_FILE_NAME};
pub use store::FileBackupManager;

use rt_common::{BackupInfo, BackupName, DeviceCapabilities, ValidationResult};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid backup request: {0}")]
    InvalidRequest(String),

    #[error("backup already exists: {name}")]
    AlreadyExists { name: String },

    #[error("backup not found: {name}")]
    NotFound { name: String },

    #[error("partition {partition} is not readable: {source}")]
    PartitionUnavailable {
        partition: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("invalid manifest at {}: {reason}", path.display())]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<BackupError> for rt_common::Error {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::InvalidRequest(msg) => rt_common::Error::Config(msg),
            BackupError::AlreadyExists { name } => rt_common::Error::BackupExists { name },
            BackupError::NotFound { name } => rt_common::Error::BackupNotFound { name },
            BackupError::PartitionUnavailable { source, .. } => rt_common::Error::Io(source),
            BackupError::ChecksumMismatch {
                subject,
                expected,
                actual,
            } => rt_common::Error::ChecksumMismatch {
                subject,
                expected,
                actual,
            },
            BackupError::ManifestInvalid { path, reason } => rt_common::Error::ChecksumMismatch {
                subject: path.display().to_string(),
                expected: "valid manifest".to_string(),
                actual: reason,
            },
            BackupError::Io(e) => rt_common::Error::Io(e),
            BackupError::Json(e) => rt_common::Error::Json(e),
        }
    }
}

/// Creates, lists and restores partition backups.
pub trait BackupManager: Send + Sync {
    /// Capture `partitions` under `name`. Fails with `AlreadyExists` rather
    /// than overwrite.
    fn create_backup(
        &self,
        name: &BackupName,
        partitions: &[String],
        device: &DeviceCapabilities,
    ) -> Result<BackupInfo, BackupError>;

    /// Verify every image against the manifest, then write them back.
    ///
    /// An `Err` means nothing was written. Once writing starts, problems are
    /// reported through the returned [`ValidationResult`].
    fn restore(&self, info: &BackupInfo) -> Result<ValidationResult, BackupError>;

    /// Every readable backup, oldest first.
    fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError>;

    /// Newest backup covering all of `partitions`.
    fn find_covering(&self, partitions: &[String]) -> Result<Option<BackupInfo>, BackupError> {
        Ok(self
            .list_backups()?
            .into_iter()
            .rev()
            .find(|b| b.covers(partitions)))
    }

    fn find(&self, name: &BackupName) -> Result<BackupInfo, BackupError> {
        self.list_backups()?
            .into_iter()
            .find(|b| &b.name == name)
            .ok_or_else(|| BackupError::NotFound {
                name: name.to_string(),
            })
    }
}
