//! Safety gate verdicts.

use serde::{Deserialize, Serialize};

/// Classification of device state against an operation's requirements.
///
/// `passed` is false whenever `critical_issues` is non-empty.
/// `can_proceed_with_warning` is true only when there are no critical issues
/// but at least one warning; such a run needs an explicit acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafetyCheckResult {
    pub passed: bool,
    pub warnings: Vec<String>,
    pub critical_issues: Vec<String>,
    pub can_proceed_with_warning: bool,
}

impl SafetyCheckResult {
    /// Build a result from collected findings, deriving the two flags.
    pub fn from_findings(warnings: Vec<String>, critical_issues: Vec<String>) -> Self {
        let passed = critical_issues.is_empty();
        let can_proceed_with_warning = passed && !warnings.is_empty();
        SafetyCheckResult {
            passed,
            warnings,
            critical_issues,
            can_proceed_with_warning,
        }
    }

    /// No issues of any kind.
    pub fn is_clean(&self) -> bool {
        self.passed && self.warnings.is_empty()
    }

    /// Whether a run may proceed given the caller's acknowledgement.
    pub fn allows(&self, warnings_acknowledged: bool) -> bool {
        self.is_clean() || (self.can_proceed_with_warning && warnings_acknowledged)
    }
}
