//! Post-operation verification outcome.

use serde::{Deserialize, Serialize};

/// Marker that escalates a verification issue to `requires_recovery`.
pub const CRITICAL_MARKER: &str = "CRITICAL:";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub success: bool,
    pub issues: Vec<String>,
    /// The device may be left unbootable; the pipeline must attempt rollback.
    pub requires_recovery: bool,
}

impl ValidationResult {
    pub fn ok() -> Self {
        ValidationResult {
            success: true,
            issues: Vec::new(),
            requires_recovery: false,
        }
    }

    /// Build from collected issues. Any issue carrying [`CRITICAL_MARKER`]
    /// sets `requires_recovery`.
    pub fn from_issues(issues: Vec<String>) -> Self {
        let requires_recovery = issues.iter().any(|i| i.contains(CRITICAL_MARKER));
        ValidationResult {
            success: issues.is_empty(),
            issues,
            requires_recovery,
        }
    }
}
