//! Retention mechanisms and their aggregate status.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A way for the host application to survive a ROM wipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMechanism {
    ApkBackup,
    AddonDScript,
    RecoveryZip,
    MagiskModule,
}

impl RetentionMechanism {
    pub const ALL: [RetentionMechanism; 4] = [
        RetentionMechanism::ApkBackup,
        RetentionMechanism::AddonDScript,
        RetentionMechanism::RecoveryZip,
        RetentionMechanism::MagiskModule,
    ];
}

impl std::fmt::Display for RetentionMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionMechanism::ApkBackup => write!(f, "apk_backup"),
            RetentionMechanism::AddonDScript => write!(f, "addon_d_script"),
            RetentionMechanism::RecoveryZip => write!(f, "recovery_zip"),
            RetentionMechanism::MagiskModule => write!(f, "magisk_module"),
        }
    }
}

/// Outcome of staging every retention mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionStatus {
    /// Always holds exactly one entry per [`RetentionMechanism`].
    pub mechanisms: BTreeMap<RetentionMechanism, bool>,
    pub retention_dir_path: PathBuf,
    pub package_identifier: String,
    pub timestamp_epoch_ms: i64,
}

impl RetentionStatus {
    /// Start a status with every mechanism marked failed.
    pub fn new(retention_dir_path: PathBuf, package_identifier: impl Into<String>) -> Self {
        RetentionStatus {
            mechanisms: RetentionMechanism::ALL.iter().map(|m| (*m, false)).collect(),
            retention_dir_path,
            package_identifier: package_identifier.into(),
            timestamp_epoch_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn record(&mut self, mechanism: RetentionMechanism, succeeded: bool) {
        self.mechanisms.insert(mechanism, succeeded);
    }

    pub fn succeeded(&self, mechanism: RetentionMechanism) -> bool {
        self.mechanisms.get(&mechanism).copied().unwrap_or(false)
    }

    pub fn success_count(&self) -> usize {
        self.mechanisms.values().filter(|ok| **ok).count()
    }

    /// At least two independent mechanisms are in place.
    pub fn is_fully_protected(&self) -> bool {
        self.success_count() >= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_status_has_four_failed_entries() {
        let status = RetentionStatus::new(PathBuf::from("/data/local/rt"), "com.example.app");
        assert_eq!(status.mechanisms.len(), 4);
        assert_eq!(status.success_count(), 0);
        assert!(!status.is_fully_protected());
    }

    #[test]
    fn test_record_overwrites_in_place() {
        let mut status = RetentionStatus::new(PathBuf::from("/r"), "pkg");
        status.record(RetentionMechanism::ApkBackup, true);
        status.record(RetentionMechanism::ApkBackup, true);
        status.record(RetentionMechanism::RecoveryZip, true);
        assert_eq!(status.mechanisms.len(), 4);
        assert_eq!(status.success_count(), 2);
        assert!(status.is_fully_protected());
    }
}
