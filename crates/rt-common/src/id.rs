//! Run and artifact identity types.
//!
//! A pipeline run is identified by a [`RunId`]; persisted artifacts such as
//! backups are addressed by validated names so they can be used as directory
//! names without escaping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Run ID for correlating a single pipeline invocation across logs and progress.
///
/// Format: `rt-YYYYMMDD-HHMMSS-XXXX`
/// Example: `rt-20260115-143022-a7xq`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new run ID.
    pub fn new() -> Self {
        let now = chrono::Utc::now();
        let suffix = generate_base32_suffix();
        RunId(format!(
            "rt-{}-{}-{}",
            now.format("%Y%m%d"),
            now.format("%H%M%S"),
            suffix
        ))
    }

    /// Parse an existing run ID string.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 23 {
            return None;
        }
        let bytes = s.as_bytes();
        if bytes.first() != Some(&b'r')
            || bytes.get(1) != Some(&b't')
            || bytes.get(2) != Some(&b'-')
            || bytes.get(11) != Some(&b'-')
            || bytes.get(18) != Some(&b'-')
        {
            return None;
        }
        let date = &s[3..11];
        let time = &s[12..18];
        let suffix = &s[19..23];
        if !date.chars().all(|c| c.is_ascii_digit()) || !time.chars().all(|c| c.is_ascii_digit())
        {
            return None;
        }
        if !suffix.chars().all(|c| matches!(c, 'a'..='z' | '2'..='7')) {
            return None;
        }
        Some(RunId(s.to_string()))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a backup, doubling as its directory name under the backup root.
///
/// Restricted to `[A-Za-z0-9._-]{1,64}` and may not start with a dot, so a
/// name can never escape the backup root or collide with the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackupName(String);

/// Rejected backup name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid backup name {name:?}: must match [A-Za-z0-9._-]{{1,64}} and not start with '.'")]
pub struct InvalidBackupName {
    pub name: String,
}

impl BackupName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidBackupName> {
        let name = name.into();
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if (1..=64).contains(&name.len()) && valid_chars && !name.starts_with('.') {
            Ok(BackupName(name))
        } else {
            Err(InvalidBackupName { name })
        }
    }

    /// Generate a timestamped name (`backup-YYYYMMDD-HHMMSS`).
    pub fn timestamped(prefix: &str) -> Result<Self, InvalidBackupName> {
        let now = chrono::Utc::now();
        Self::new(format!("{}-{}", prefix, now.format("%Y%m%d-%H%M%S")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BackupName {
    type Error = InvalidBackupName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BackupName::new(value)
    }
}

impl From<BackupName> for String {
    fn from(name: BackupName) -> Self {
        name.0
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn generate_base32_suffix() -> String {
    let uuid = uuid::Uuid::new_v4();
    let bytes = uuid.as_bytes();
    let mut value = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | (bytes[2] as u32);
    value &= 0x000F_FFFF;
    let alphabet = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity(4);
    for shift in [15_u32, 10, 5, 0] {
        let idx = ((value >> shift) & 0x1F) as usize;
        out.push(alphabet[idx] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_format() {
        let id = RunId::new();
        assert!(id.0.starts_with("rt-"));
        assert_eq!(id.0.len(), 23);
        assert_eq!(RunId::parse(&id.0), Some(id));
    }

    #[test]
    fn test_run_id_parse_rejects_garbage() {
        assert!(RunId::parse("pt-20260115-143022-a7xq").is_none());
        assert!(RunId::parse("rt-2026011x-143022-a7xq").is_none());
        assert!(RunId::parse("rt-20260115-143022-A7XQ").is_none());
        assert!(RunId::parse("rt-short").is_none());
    }

    #[test]
    fn test_backup_name_accepts_simple_names() {
        assert!(BackupName::new("pre-flash_boot.1").is_ok());
        assert!(BackupName::new("a").is_ok());
    }

    #[test]
    fn test_backup_name_rejects_traversal() {
        assert!(BackupName::new("../etc").is_err());
        assert!(BackupName::new("a/b").is_err());
        assert!(BackupName::new(".hidden").is_err());
        assert!(BackupName::new("").is_err());
        assert!(BackupName::new("x".repeat(65)).is_err());
    }

    #[test]
    fn test_backup_name_serde_validates() {
        let ok: BackupName = serde_json::from_str("\"nightly\"").unwrap();
        assert_eq!(ok.as_str(), "nightly");
        assert!(serde_json::from_str::<BackupName>("\"../x\"").is_err());
    }

    #[test]
    fn test_timestamped_name_is_valid() {
        let name = BackupName::timestamped("auto").unwrap();
        assert!(name.as_str().starts_with("auto-"));
    }
}
