//! Backup manifest types and serialization.
//!
//! The manifest is the source of truth for a backup's contents: one entry per
//! captured partition with its size and SHA-256, plus an aggregate checksum
//! over the ordered per-partition digests.

use rt_common::{BackupInfo, BackupName, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::BackupError;

/// Manifest file name within a backup directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub schema_version: String,
    pub name: String,
    pub created_at_epoch_ms: i64,
    pub device_model: String,
    pub os_version: String,
    /// Partitions in capture order.
    pub partitions: Vec<PartitionEntry>,
    /// SHA-256 over the ordered per-partition digests.
    pub aggregate_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub name: String,
    /// Image file name relative to the backup directory.
    pub file: String,
    pub size_bytes: u64,
    pub sha256: String,
}

impl PartitionEntry {
    pub fn image_file_name(partition: &str) -> String {
        format!("{}.img", partition)
    }
}

impl BackupManifest {
    pub fn new(
        name: &BackupName,
        device_model: impl Into<String>,
        os_version: impl Into<String>,
        partitions: Vec<PartitionEntry>,
    ) -> Self {
        let aggregate_sha256 = aggregate_checksum(&partitions);
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            name: name.to_string(),
            created_at_epoch_ms: chrono::Utc::now().timestamp_millis(),
            device_model: device_model.into(),
            os_version: os_version.into(),
            partitions,
            aggregate_sha256,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.partitions.iter().map(|p| p.size_bytes).sum()
    }

    pub fn partition_names(&self) -> Vec<String> {
        self.partitions.iter().map(|p| p.name.clone()).collect()
    }

    /// Structural checks that do not touch the image files.
    pub fn validate(&self, path: &Path) -> Result<(), BackupError> {
        let invalid = |reason: String| BackupError::ManifestInvalid {
            path: path.to_path_buf(),
            reason,
        };
        if self.schema_version != SCHEMA_VERSION {
            return Err(invalid(format!(
                "unsupported schema version {}",
                self.schema_version
            )));
        }
        if self.partitions.is_empty() {
            return Err(invalid("no partitions recorded".to_string()));
        }
        for entry in &self.partitions {
            if entry.file != PartitionEntry::image_file_name(&entry.name) {
                return Err(invalid(format!(
                    "unexpected image file {:?} for partition {}",
                    entry.file, entry.name
                )));
            }
        }
        let expected = aggregate_checksum(&self.partitions);
        if expected != self.aggregate_sha256 {
            return Err(BackupError::ChecksumMismatch {
                subject: format!("{} (aggregate)", self.name),
                expected: self.aggregate_sha256.clone(),
                actual: expected,
            });
        }
        Ok(())
    }

    pub fn to_info(&self, storage_path: PathBuf) -> Result<BackupInfo, BackupError> {
        let name = BackupName::new(self.name.clone()).map_err(|e| BackupError::ManifestInvalid {
            path: storage_path.join(MANIFEST_FILE_NAME),
            reason: e.to_string(),
        })?;
        Ok(BackupInfo {
            name,
            storage_path,
            size_bytes: self.total_bytes(),
            created_at_epoch_ms: self.created_at_epoch_ms,
            device_model: self.device_model.clone(),
            os_version: self.os_version.clone(),
            partitions: self.partition_names(),
        })
    }

    pub fn read_from(dir: &Path) -> Result<Self, BackupError> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::ManifestInvalid {
                    path,
                    reason: "manifest.json is missing".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: BackupManifest =
            serde_json::from_str(&json).map_err(|e| BackupError::ManifestInvalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        manifest.validate(&path)?;
        Ok(manifest)
    }
}

/// SHA-256 of the per-partition digests, one per line, in capture order.
pub fn aggregate_checksum(entries: &[PartitionEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.sha256.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
