//! Configuration snapshots for audit and reproducibility.
//!
//! A snapshot captures the exact configuration in force when a run starts, so
//! a blocked or failed operation can be explained after the fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::resolve::{ConfigPaths, ConfigSource};
use crate::{Layout, Policy};

/// A frozen snapshot of configuration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub timestamp: DateTime<Utc>,

    pub schema_version: String,

    /// SHA-256 of the policy JSON content, if loaded from a file.
    #[serde(default)]
    pub policy_hash: Option<String>,

    #[serde(default)]
    pub policy_path: Option<String>,

    pub policy_source: String,

    /// SHA-256 of the layout JSON content, if loaded from a file.
    #[serde(default)]
    pub layout_hash: Option<String>,

    #[serde(default)]
    pub layout_path: Option<String>,

    pub layout_source: String,

    /// Combined hash of both files (for quick comparison).
    pub combined_hash: String,

    pub summary: ConfigSummary,
}

/// Key values for quick reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub min_battery_percent: u8,
    pub storage_margin: f64,
    pub max_status_age_ms: u64,
    pub auto_backup: bool,
    pub backup_root: String,
    pub retention_root: String,
    pub partition_dir: String,
}

impl ConfigSnapshot {
    /// Create a new snapshot from loaded configuration and the raw file contents.
    pub fn new(
        policy: &Policy,
        layout: &Layout,
        paths: &ConfigPaths,
        policy_json: Option<&str>,
        layout_json: Option<&str>,
    ) -> Self {
        let policy_hash = policy_json.map(hash_content);
        let layout_hash = layout_json.map(hash_content);

        let combined = format!(
            "{}:{}",
            policy_hash.as_deref().unwrap_or("none"),
            layout_hash.as_deref().unwrap_or("none")
        );

        ConfigSnapshot {
            timestamp: Utc::now(),
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            policy_hash,
            policy_path: paths.policy.as_ref().map(|p| p.display().to_string()),
            policy_source: paths.policy_source.to_string(),
            layout_hash,
            layout_path: paths.layout.as_ref().map(|p| p.display().to_string()),
            layout_source: paths.layout_source.to_string(),
            combined_hash: hash_content(&combined),
            summary: ConfigSummary::of(policy, layout),
        }
    }

    /// Create a snapshot with only defaults (no config files loaded).
    pub fn defaults_only(policy: &Policy, layout: &Layout) -> Self {
        ConfigSnapshot {
            timestamp: Utc::now(),
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            policy_hash: None,
            policy_path: None,
            policy_source: ConfigSource::BuiltinDefault.to_string(),
            layout_hash: None,
            layout_path: None,
            layout_source: ConfigSource::BuiltinDefault.to_string(),
            combined_hash: hash_content("none:none"),
            summary: ConfigSummary::of(policy, layout),
        }
    }

    /// Check if this snapshot matches another (same config).
    pub fn matches(&self, other: &ConfigSnapshot) -> bool {
        self.combined_hash == other.combined_hash
    }

    /// Short identifier for this snapshot (first 12 chars of hash).
    pub fn short_id(&self) -> &str {
        &self.combined_hash[..12.min(self.combined_hash.len())]
    }
}

impl ConfigSummary {
    fn of(policy: &Policy, layout: &Layout) -> Self {
        ConfigSummary {
            min_battery_percent: policy.safety.min_battery_percent,
            storage_margin: policy.safety.storage_margin,
            max_status_age_ms: policy.safety.max_status_age_ms,
            auto_backup: policy.backup.auto_backup,
            backup_root: layout.backup_root.display().to_string(),
            retention_root: layout.retention_root.display().to_string(),
            partition_dir: layout.partition_dir.display().to_string(),
        }
    }
}

/// Hash content with SHA-256 and return hex string.
fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
