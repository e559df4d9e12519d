//! Exit codes for the romtools CLI.
//!
//! Exit codes communicate the outcome without requiring output parsing.
//!
//! Exit code ranges:
//! - 0-4: Operational outcomes (the run happened; read the code)
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors

use crate::pipeline::{OperationOutcome, PipelineError};

/// Stable contract for automation. Changes require a major version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Operational outcomes (0-4)
    // ========================================================================
    /// Success
    Ok = 0,

    /// Blocked by the safety gate (nothing touched)
    Blocked = 1,

    /// Operation failed; no rollback was performed
    Failed = 2,

    /// Operation failed and a backup was restored
    RolledBack = 3,

    /// Cancelled at a stage boundary
    Cancelled = 4,

    // ========================================================================
    // User / environment errors (10-19)
    // ========================================================================
    /// Invalid arguments or configuration
    ArgsError = 10,

    /// Capability probe failed (no root, no shell, no device)
    CapabilityError = 11,

    /// Backup or image integrity problem
    IntegrityError = 12,

    /// Run lock held by another operation
    LockError = 14,

    // ========================================================================
    // Internal errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Ok
    }

    /// Codes 0-4 describe how a run ended rather than an error.
    pub fn is_operational(self) -> bool {
        (self as i32) < 10
    }

    pub fn is_user_error(self) -> bool {
        (10..20).contains(&(self as i32))
    }

    pub fn is_internal_error(self) -> bool {
        (self as i32) >= 20
    }

    /// Get the code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Ok => "OK",
            ExitCode::Blocked => "ERR_BLOCKED",
            ExitCode::Failed => "ERR_FAILED",
            ExitCode::RolledBack => "ERR_ROLLED_BACK",
            ExitCode::Cancelled => "ERR_CANCELLED",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::CapabilityError => "ERR_CAPABILITY",
            ExitCode::IntegrityError => "ERR_INTEGRITY",
            ExitCode::LockError => "ERR_LOCK",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }

    /// Exit code for a finished pipeline run.
    pub fn for_outcome(outcome: &OperationOutcome) -> Self {
        match outcome {
            OperationOutcome::Completed { .. } => ExitCode::Ok,
            OperationOutcome::Blocked { .. } => ExitCode::Blocked,
            OperationOutcome::Failed { rollback, .. } => match rollback {
                Some(report) if report.restored => ExitCode::RolledBack,
                _ => ExitCode::Failed,
            },
            OperationOutcome::Cancelled { .. } => ExitCode::Cancelled,
        }
    }

    /// Exit code for an error that prevented a run.
    pub fn for_pipeline_error(err: &PipelineError) -> Self {
        match err {
            PipelineError::ConcurrentOperation => ExitCode::LockError,
            PipelineError::Probe(_) => ExitCode::CapabilityError,
            PipelineError::InvalidRequest(_) => ExitCode::ArgsError,
            PipelineError::Lock(_) => ExitCode::IoError,
            PipelineError::WorkerGone => ExitCode::InternalError,
        }
    }

    /// Exit code for a unified error.
    pub fn for_error(err: &rt_common::Error) -> Self {
        use rt_common::ErrorCategory;
        match err {
            rt_common::Error::ConcurrentOperation => ExitCode::LockError,
            rt_common::Error::SafetyViolation { .. } => ExitCode::Blocked,
            rt_common::Error::Cancelled { .. } => ExitCode::Cancelled,
            _ => match err.category() {
                ErrorCategory::Config => ExitCode::ArgsError,
                ErrorCategory::Probe => ExitCode::CapabilityError,
                ErrorCategory::Safety => ExitCode::Blocked,
                ErrorCategory::Execution => ExitCode::Failed,
                ErrorCategory::Integrity => ExitCode::IntegrityError,
                ErrorCategory::Io => ExitCode::IoError,
            },
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
