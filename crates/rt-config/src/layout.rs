//! Filesystem layout configuration.
//!
//! `layout.json` tells romtools where artifacts live on the host and where
//! the device exposes its partitions and system directories.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Base directory for romtools-owned state on the device.
pub const DEFAULT_STATE_DIR: &str = "/data/local/romtools";

/// Complete layout configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub schema_version: String,

    /// `<backup_root>/<name>/{<partition>.img, manifest.json}`.
    pub backup_root: PathBuf,

    /// Fixed-name retention artifacts.
    pub retention_root: PathBuf,

    /// Default destination for downloaded images.
    pub download_dir: PathBuf,

    /// Directory of partition block devices addressed by name.
    pub partition_dir: PathBuf,

    /// Cross-process run lock. `None` disables the file lock.
    pub lock_path: Option<PathBuf>,

    pub addon_d_dir: PathBuf,
    pub magisk_modules_dir: PathBuf,
    pub magisk_marker: PathBuf,

    /// The application kept alive across ROM wipes.
    pub app: AppTarget,
}

/// Identity of the host application for retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppTarget {
    pub package_identifier: String,

    /// Display/directory name used inside `system/app/`.
    pub app_name: String,

    /// Installed APK. When unset, resolved with `pm path` at setup time.
    pub apk_path: Option<PathBuf>,

    /// Private data directory archived alongside the APK.
    pub data_dir: PathBuf,

    pub magisk_module_id: String,
}

impl Default for AppTarget {
    fn default() -> Self {
        let package = "dev.romtools.host";
        Self {
            package_identifier: package.to_string(),
            app_name: "RomTools".to_string(),
            apk_path: None,
            data_dir: PathBuf::from("/data/data").join(package),
            magisk_module_id: "romtools_retention".to_string(),
        }
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::rooted_at(Path::new(DEFAULT_STATE_DIR))
    }
}

impl Layout {
    /// Layout with every romtools-owned directory under `base`. Device paths
    /// keep their standard locations.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            backup_root: base.join("backups"),
            retention_root: base.join("retention"),
            download_dir: base.join("downloads"),
            partition_dir: PathBuf::from("/dev/block/by-name"),
            lock_path: Some(base.join("romtools.lock")),
            addon_d_dir: PathBuf::from("/system/addon.d"),
            magisk_modules_dir: PathBuf::from("/data/adb/modules"),
            magisk_marker: PathBuf::from("/data/adb/magisk"),
            app: AppTarget::default(),
        }
    }

    /// Load layout from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, crate::validate::ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::validate::ValidationError::IoError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::parse_json(&content)
    }

    /// Parse layout from a JSON string.
    pub fn parse_json(json: &str) -> Result<Self, crate::validate::ValidationError> {
        serde_json::from_str(json).map_err(|e| {
            crate::validate::ValidationError::ParseError(format!("Invalid JSON: {}", e))
        })
    }

    /// Path of a partition's block device.
    pub fn partition_path(&self, partition: &str) -> PathBuf {
        self.partition_dir.join(partition)
    }
}
