//! Backup descriptors.

use crate::id::BackupName;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An immutable, checksummed capture of one or more partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: BackupName,
    pub storage_path: PathBuf,
    pub size_bytes: u64,
    pub created_at_epoch_ms: i64,
    pub device_model: String,
    pub os_version: String,
    /// Partition names in capture order.
    pub partitions: Vec<String>,
}

impl BackupInfo {
    /// Whether every partition in `targets` is captured by this backup.
    pub fn covers<S: AsRef<str>>(&self, targets: &[S]) -> bool {
        targets
            .iter()
            .all(|t| self.partitions.iter().any(|p| p == t.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers() {
        let info = BackupInfo {
            name: BackupName::new("pre-flash").unwrap(),
            storage_path: PathBuf::from("/tmp/pre-flash"),
            size_bytes: 10,
            created_at_epoch_ms: 1,
            device_model: "Pixel".into(),
            os_version: "14".into(),
            partitions: vec!["boot".into(), "dtbo".into()],
        };
        assert!(info.covers(&["boot"]));
        assert!(info.covers(&["dtbo", "boot"]));
        assert!(!info.covers(&["boot", "vendor_boot"]));
        assert!(info.covers::<&str>(&[]));
    }
}
