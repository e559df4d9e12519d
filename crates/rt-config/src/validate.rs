//! Configuration validation errors and semantic validation.

use std::path::Path;
use thiserror::Error;

use crate::layout::Layout;
use crate::policy::Policy;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Semantic validation failed: {0}")]
    SemanticError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::IoError(_) => 60,
            ValidationError::ParseError(_) => 61,
            ValidationError::SemanticError(_) => 63,
            ValidationError::InvalidValue { .. } => 65,
            ValidationError::VersionMismatch { .. } => 66,
        }
    }
}

fn check_version(actual: &str) -> ValidationResult<()> {
    if actual != crate::CONFIG_SCHEMA_VERSION {
        return Err(ValidationError::VersionMismatch {
            expected: crate::CONFIG_SCHEMA_VERSION.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate policy configuration semantically.
pub fn validate_policy(policy: &Policy) -> ValidationResult<()> {
    check_version(&policy.schema_version)?;

    let safety = &policy.safety;
    if safety.min_battery_percent > 100 {
        return Err(invalid(
            "safety.min_battery_percent",
            format!("Must be in [0, 100], got {}", safety.min_battery_percent),
        ));
    }
    if safety.low_battery_warning_percent > 100 {
        return Err(invalid(
            "safety.low_battery_warning_percent",
            format!(
                "Must be in [0, 100], got {}",
                safety.low_battery_warning_percent
            ),
        ));
    }
    if !safety.storage_margin.is_finite() || safety.storage_margin < 0.0 {
        return Err(invalid(
            "safety.storage_margin",
            format!("Must be a non-negative fraction, got {}", safety.storage_margin),
        ));
    }
    if safety.max_status_age_ms == 0 {
        return Err(invalid("safety.max_status_age_ms", "Must be > 0"));
    }
    if safety.compatible_manufacturers.iter().any(|m| m.trim().is_empty()) {
        return Err(invalid(
            "safety.compatible_manufacturers",
            "Entries must not be empty",
        ));
    }

    let backup = &policy.backup;
    if backup.io_buffer_bytes == 0 {
        return Err(invalid("backup.io_buffer_bytes", "Must be > 0"));
    }
    if backup.auto_backup && backup.bootloader_partitions.is_empty() {
        return Err(ValidationError::SemanticError(
            "backup.bootloader_partitions must name at least one partition when auto_backup is on"
                .to_string(),
        ));
    }
    for partition in &backup.bootloader_partitions {
        validate_partition_name("backup.bootloader_partitions", partition)?;
    }

    let download = &policy.download;
    if download.chunk_size_bytes == 0 {
        return Err(invalid("download.chunk_size_bytes", "Must be > 0"));
    }
    if download.resume_window_bytes == 0 {
        return Err(invalid("download.resume_window_bytes", "Must be > 0"));
    }

    Ok(())
}

/// Validate layout configuration semantically.
pub fn validate_layout(layout: &Layout) -> ValidationResult<()> {
    check_version(&layout.schema_version)?;

    let dirs: [(&str, &Path); 4] = [
        ("backup_root", &layout.backup_root),
        ("retention_root", &layout.retention_root),
        ("download_dir", &layout.download_dir),
        ("partition_dir", &layout.partition_dir),
    ];
    for (field, path) in dirs {
        if !path.is_absolute() {
            return Err(invalid(field, format!("Must be absolute, got {}", path.display())));
        }
    }

    if layout.backup_root == layout.retention_root {
        return Err(ValidationError::SemanticError(
            "backup_root and retention_root must differ".to_string(),
        ));
    }

    let app = &layout.app;
    if app.package_identifier.is_empty()
        || !app
            .package_identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
    {
        return Err(invalid(
            "app.package_identifier",
            format!("Not a valid package name: {:?}", app.package_identifier),
        ));
    }
    if app.app_name.is_empty() || app.app_name.contains('/') {
        return Err(invalid(
            "app.app_name",
            format!("Must be a plain directory name, got {:?}", app.app_name),
        ));
    }
    if app.magisk_module_id.is_empty() || app.magisk_module_id.contains('/') {
        return Err(invalid(
            "app.magisk_module_id",
            format!("Must be a plain directory name, got {:?}", app.magisk_module_id),
        ));
    }

    Ok(())
}

fn validate_partition_name(field: &str, name: &str) -> ValidationResult<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(invalid(field, format!("Invalid partition name {:?}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        validate_policy(&Policy::default()).unwrap();
        validate_layout(&Layout::default()).unwrap();
    }

    #[test]
    fn rejects_battery_over_100() {
        let mut policy = Policy::default();
        policy.safety.min_battery_percent = 101;
        assert!(matches!(
            validate_policy(&policy),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn rejects_negative_margin() {
        let mut policy = Policy::default();
        policy.safety.storage_margin = -0.1;
        assert!(validate_policy(&policy).is_err());
    }

    #[test]
    fn rejects_bad_partition_names() {
        let mut policy = Policy::default();
        policy.backup.bootloader_partitions = vec!["../boot".to_string()];
        assert!(validate_policy(&policy).is_err());
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut policy = Policy::default();
        policy.schema_version = "0.9.0".to_string();
        assert!(matches!(
            validate_policy(&policy),
            Err(ValidationError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn rejects_relative_layout_paths() {
        let mut layout = Layout::default();
        layout.backup_root = "backups".into();
        assert!(validate_layout(&layout).is_err());
    }

    #[test]
    fn rejects_shared_roots() {
        let mut layout = Layout::default();
        layout.retention_root = layout.backup_root.clone();
        assert!(matches!(
            validate_layout(&layout),
            Err(ValidationError::SemanticError(_))
        ));
    }
}
