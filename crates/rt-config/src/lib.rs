//! romtools configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for policy.json and layout.json
//! - Config resolution (CLI → env → XDG → /etc → defaults)
//! - Semantic validation
//! - Config snapshots for run audit

pub mod layout;
pub mod policy;
pub mod resolve;
pub mod snapshot;
pub mod validate;

pub use layout::{AppTarget, Layout};
pub use policy::{BackupPolicy, DownloadPolicy, Policy, SafetyPolicy};
pub use resolve::{resolve_config, resolve_config_dir, ConfigPaths, ConfigSource};
pub use snapshot::ConfigSnapshot;
pub use validate::{validate_layout, validate_policy, ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";

/// Fully loaded and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub policy: Policy,
    pub layout: Layout,
    pub paths: ConfigPaths,
    pub snapshot: ConfigSnapshot,
}

impl Config {
    /// Load and validate the files named by `paths`, falling back to
    /// defaults for any file that was not found.
    pub fn load(paths: ConfigPaths) -> ValidationResult<Self> {
        let (policy, policy_json) = match &paths.policy {
            Some(path) => {
                let raw = read(path)?;
                (Policy::parse_json(&raw)?, Some(raw))
            }
            None => (Policy::default(), None),
        };
        let (layout, layout_json) = match &paths.layout {
            Some(path) => {
                let raw = read(path)?;
                (Layout::parse_json(&raw)?, Some(raw))
            }
            None => (Layout::default(), None),
        };

        validate_policy(&policy)?;
        validate_layout(&layout)?;

        let snapshot = ConfigSnapshot::new(
            &policy,
            &layout,
            &paths,
            policy_json.as_deref(),
            layout_json.as_deref(),
        );
        Ok(Config {
            policy,
            layout,
            paths,
            snapshot,
        })
    }

    /// Built-in defaults only.
    pub fn defaults() -> Self {
        let policy = Policy::default();
        let layout = Layout::default();
        let snapshot = ConfigSnapshot::defaults_only(&policy, &layout);
        Config {
            policy,
            layout,
            paths: ConfigPaths::default(),
            snapshot,
        }
    }
}

fn read(path: &std::path::Path) -> ValidationResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        ValidationError::IoError(format!("Failed to read {}: {}", path.display(), e))
    })
}
