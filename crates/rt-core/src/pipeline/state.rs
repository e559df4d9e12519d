//! Pipeline states, requests and terminal outcomes.

use crate::flash::{FlashReport, ImageFile};
use crate::retention::RestoreReport;
use rt_common::{
    BackupInfo, BackupName, DeviceCapabilities, OperationKind, RetentionStatus, RunId,
    SafetyCheckResult,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Probing,
    Gating,
    Executing,
    Verifying,
    RollingBack,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Completed
                | PipelineState::Failed
                | PipelineState::Blocked
                | PipelineState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Probing => "probing",
            PipelineState::Gating => "gating",
            PipelineState::Executing => "executing",
            PipelineState::Verifying => "verifying",
            PipelineState::RollingBack => "rolling_back",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
            PipelineState::Blocked => "blocked",
            PipelineState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller's answer to gate warnings. There is no default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningAcknowledgement {
    Acknowledged,
    Declined,
}

impl WarningAcknowledgement {
    pub fn from_flag(acknowledged: bool) -> Self {
        if acknowledged {
            WarningAcknowledgement::Acknowledged
        } else {
            WarningAcknowledgement::Declined
        }
    }

    pub fn is_acknowledged(self) -> bool {
        self == WarningAcknowledgement::Acknowledged
    }
}

/// What to run and on what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationRequest {
    pub kind: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageFile>,
    /// Target partition. Flash-recovery defaults to `recovery`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// Stage host-app retention before the destructive step and reinstall
    /// afterwards.
    pub retain: bool,
    /// Name for the pre-operation backup instead of a generated one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<BackupName>,
}

impl OperationRequest {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            image: None,
            partition: None,
            retain: false,
            backup_name: None,
        }
    }

    pub fn with_image(mut self, image: ImageFile) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_retention(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_backup_name(mut self, name: BackupName) -> Self {
        self.backup_name = Some(name);
        self
    }

    /// Partition an image is written to, if this kind writes one.
    pub fn target_partition(&self) -> Option<String> {
        match self.kind {
            OperationKind::FlashPartition => self.partition.clone(),
            OperationKind::FlashRecovery => Some(
                self.partition
                    .clone()
                    .unwrap_or_else(|| "recovery".to_string()),
            ),
            _ => None,
        }
    }
}

/// Retention work done alongside a completed run. Failures here never fail
/// the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged: Option<RetentionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored: Option<RestoreReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackReport {
    pub backup: BackupName,
    /// Every partition was written back and read back intact.
    pub restored: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationOutcome {
    Completed {
        #[serde(skip_serializing_if = "Option::is_none")]
        backup: Option<BackupInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        flash: Option<FlashReport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retention: Option<RetentionReport>,
        /// Gate warnings the caller acknowledged.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        acknowledged_warnings: Vec<String>,
    },
    Blocked {
        issues: Vec<String>,
        safety: SafetyCheckResult,
    },
    Failed {
        issues: Vec<String>,
        requires_recovery: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        rollback: Option<RollbackReport>,
    },
    Cancelled {
        stage: String,
    },
}

impl OperationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, OperationOutcome::Completed { .. })
    }

    pub fn state(&self) -> PipelineState {
        match self {
            OperationOutcome::Completed { .. } => PipelineState::Completed,
            OperationOutcome::Blocked { .. } => PipelineState::Blocked,
            OperationOutcome::Failed { .. } => PipelineState::Failed,
            OperationOutcome::Cancelled { .. } => PipelineState::Cancelled,
        }
    }

    /// Human-readable issues; empty for completed and cancelled runs.
    pub fn issues(&self) -> &[String] {
        match self {
            OperationOutcome::Blocked { issues, .. } | OperationOutcome::Failed { issues, .. } => {
                issues
            }
            _ => &[],
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub operation: OperationKind,
    pub transitions: Vec<PipelineState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<DeviceCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetyCheckResult>,
    pub outcome: OperationOutcome,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn final_state(&self) -> PipelineState {
        self.outcome.state()
    }

    pub fn visited(&self, state: PipelineState) -> bool {
        self.transitions.contains(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_defaults_target() {
        let req = OperationRequest::new(OperationKind::FlashRecovery);
        assert_eq!(req.target_partition().as_deref(), Some("recovery"));
        let req = OperationRequest::new(OperationKind::FlashPartition);
        assert_eq!(req.target_partition(), None);
        let req = req.with_partition("boot");
        assert_eq!(req.target_partition().as_deref(), Some("boot"));
        assert_eq!(OperationRequest::new(OperationKind::Unlock).target_partition(), None);
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = [
            PipelineState::Idle,
            PipelineState::Probing,
            PipelineState::Gating,
            PipelineState::Executing,
            PipelineState::Verifying,
            PipelineState::RollingBack,
            PipelineState::Completed,
            PipelineState::Failed,
            PipelineState::Blocked,
            PipelineState::Cancelled,
        ]
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
        assert_eq!(terminal.len(), 4);
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let outcome = OperationOutcome::Cancelled {
            stage: "gating".into(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert_eq!(json, r#"{"outcome":"cancelled","stage":"gating"}"#);
        assert!(outcome.issues().is_empty());
        assert_eq!(outcome.state(), PipelineState::Cancelled);
    }

    #[test]
    fn test_acknowledgement_from_flag() {
        assert!(WarningAcknowledgement::from_flag(true).is_acknowledged());
        assert!(!WarningAcknowledgement::from_flag(false).is_acknowledged());
    }
}
