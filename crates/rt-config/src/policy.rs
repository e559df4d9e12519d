//! Policy configuration types.
//!
//! `policy.json` carries the thresholds the safety gate and the pipeline
//! enforce. Every section is optional in the file; missing sections fall back
//! to the defaults below.

use serde::{Deserialize, Serialize};

/// 500 MiB.
pub const DEFAULT_STORAGE_FLOOR_BYTES: u64 = 500 * 1024 * 1024;

/// Complete policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub schema_version: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub safety: SafetyPolicy,

    #[serde(default)]
    pub backup: BackupPolicy,

    #[serde(default)]
    pub download: DownloadPolicy,
}

/// Thresholds consulted by the safety gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    /// Below this, operations requiring high battery are blocked.
    pub min_battery_percent: u8,

    /// Below this, any operation gets a low-battery warning.
    pub low_battery_warning_percent: u8,

    /// Extra free space required on top of the image size (0.20 = 20%).
    pub storage_margin: f64,

    /// Free space required when no image size is known.
    pub storage_floor_bytes: u64,

    /// A status older than this is refreshed before a destructive step.
    pub max_status_age_ms: u64,

    /// Manufacturer substrings (case-insensitive) considered compatible.
    pub compatible_manufacturers: Vec<String>,

    /// Emit a warning when SELinux is enforcing.
    pub warn_on_selinux_enforcing: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            min_battery_percent: 50,
            low_battery_warning_percent: 30,
            storage_margin: 0.20,
            storage_floor_bytes: DEFAULT_STORAGE_FLOOR_BYTES,
            max_status_age_ms: 5_000,
            compatible_manufacturers: [
                "OnePlus", "Xiaomi", "Google", "Samsung", "Motorola", "Nokia", "ASUS",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            warn_on_selinux_enforcing: true,
        }
    }
}

impl SafetyPolicy {
    /// Free space needed to stage an image of `image_size` bytes, or the
    /// floor when the size is unknown.
    pub fn required_storage(&self, image_size: Option<u64>) -> u64 {
        match image_size {
            Some(size) => (size as f64 * (1.0 + self.storage_margin)).ceil() as u64,
            None => self.storage_floor_bytes,
        }
    }

    pub fn is_compatible_manufacturer(&self, manufacturer: &str) -> bool {
        let manufacturer = manufacturer.to_ascii_lowercase();
        self.compatible_manufacturers
            .iter()
            .any(|m| manufacturer.contains(&m.to_ascii_lowercase()))
    }
}

/// Automatic pre-operation backups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupPolicy {
    /// Back up affected partitions before a destructive write.
    pub auto_backup: bool,

    /// Partitions captured before unlocking or locking the bootloader.
    pub bootloader_partitions: Vec<String>,

    /// Name prefix for automatic backups.
    pub name_prefix: String,

    /// Read/write buffer size for partition images.
    pub io_buffer_bytes: usize,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            auto_backup: true,
            bootloader_partitions: vec!["boot".to_string(), "vbmeta".to_string()],
            name_prefix: "auto".to_string(),
            io_buffer_bytes: 1024 * 1024,
        }
    }
}

/// Resumable download tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadPolicy {
    /// Bytes fetched between checkpoints.
    pub chunk_size_bytes: usize,

    /// Trailing window re-verified on resume.
    pub resume_window_bytes: u64,

    /// Per-request timeout for remote sources.
    pub timeout_secs: u64,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 1024 * 1024,
            resume_window_bytes: 64 * 1024,
            timeout_secs: 30,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            description: None,
            safety: SafetyPolicy::default(),
            backup: BackupPolicy::default(),
            download: DownloadPolicy::default(),
        }
    }
}

impl Policy {
    /// Load policy from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::validate::ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::validate::ValidationError::IoError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::parse_json(&content)
    }

    /// Parse policy from a JSON string.
    pub fn parse_json(json: &str) -> Result<Self, crate::validate::ValidationError> {
        serde_json::from_str(json).map_err(|e| {
            crate::validate::ValidationError::ParseError(format!("Invalid JSON: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_defaults() {
        let s = SafetyPolicy::default();
        assert_eq!(s.min_battery_percent, 50);
        assert_eq!(s.low_battery_warning_percent, 30);
        assert!((s.storage_margin - 0.20).abs() < f64::EPSILON);
        assert_eq!(s.storage_floor_bytes, 500 * 1024 * 1024);
        assert_eq!(s.compatible_manufacturers.len(), 7);
    }

    #[test]
    fn required_storage_applies_margin() {
        let s = SafetyPolicy::default();
        assert_eq!(s.required_storage(Some(1_000)), 1_200);
        assert_eq!(s.required_storage(None), DEFAULT_STORAGE_FLOOR_BYTES);
    }

    #[test]
    fn manufacturer_match_is_case_insensitive() {
        let s = SafetyPolicy::default();
        assert!(s.is_compatible_manufacturer("google"));
        assert!(s.is_compatible_manufacturer("Xiaomi Inc."));
        assert!(!s.is_compatible_manufacturer("Acme"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let json = r#"{
            "schema_version": "1.0.0",
            "safety": { "min_battery_percent": 60 }
        }"#;
        let policy = Policy::parse_json(json).unwrap();
        assert_eq!(policy.safety.min_battery_percent, 60);
        assert_eq!(policy.safety.low_battery_warning_percent, 30);
        assert!(policy.backup.auto_backup);
        assert_eq!(policy.download.resume_window_bytes, 64 * 1024);
    }

    #[test]
    fn parse_error_is_reported() {
        assert!(matches!(
            Policy::parse_json("{ not json"),
            Err(crate::validate::ValidationError::ParseError(_))
        ));
    }
}
