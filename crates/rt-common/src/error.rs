//! Error types for romtools.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for automation
//! - Remediation suggestions for humans
//! - Suggested actions for agents
//!
//! # Human-Facing Output
//!
//! ```text
//! ✗ Safety Check Failed
//!   Reason: operation blocked by safety gate: battery level 20% is below 50%
//!   Fix: Charge the device and re-run 'romtools check <op>'.
//! ```
//!
//! # Agent-Facing Output
//!
//! ```json
//! {
//!   "code": 41,
//!   "category": "safety",
//!   "message": "operation blocked by safety gate: battery level 20% is below 50%",
//!   "recoverable": true,
//!   "suggested_action": "wait"
//! }
//! ```
//!
//! Each subsystem in `rt-core` has its own `thiserror` enum; they all convert
//! into [`Error`] at the CLI and façade boundary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for romtools operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file errors (policy, layout).
    Config,
    /// Capability probing and status refresh errors.
    Probe,
    /// Safety gate refusals and run-lock contention.
    Safety,
    /// Errors raised while a destructive step executes or is verified.
    Execution,
    /// Backup and image integrity errors.
    Integrity,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Probe => write!(f, "probe"),
            ErrorCategory::Safety => write!(f, "safety"),
            ErrorCategory::Execution => write!(f, "execution"),
            ErrorCategory::Integrity => write!(f, "integrity"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Suggested actions for agents to take in response to errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Retry the operation.
    Retry,
    /// Reset configuration to defaults.
    ResetConfig,
    /// Run the safety check command.
    RunCheck,
    /// Wait for the current operation or device condition to change.
    Wait,
    /// Request root access on the device.
    Elevate,
    /// Download the image again.
    Redownload,
    /// Boot into recovery mode and restore manually.
    ManualRecovery,
    /// Abort the operation.
    Abort,
    /// No action needed (informational).
    None,
}

impl std::fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuggestedAction::Retry => write!(f, "retry"),
            SuggestedAction::ResetConfig => write!(f, "reset_config"),
            SuggestedAction::RunCheck => write!(f, "run_check"),
            SuggestedAction::Wait => write!(f, "wait"),
            SuggestedAction::Elevate => write!(f, "elevate"),
            SuggestedAction::Redownload => write!(f, "redownload"),
            SuggestedAction::ManualRecovery => write!(f, "manual_recovery"),
            SuggestedAction::Abort => write!(f, "abort"),
            SuggestedAction::None => write!(f, "none"),
        }
    }
}

/// Unified error type for romtools.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid policy file: {0}")]
    InvalidPolicy(String),

    #[error("invalid layout file: {0}")]
    InvalidLayout(String),

    // Probe errors (20-29)
    #[error("capability probe failed: {0}")]
    Probe(String),

    #[error("root access is not available: {0}")]
    NoRoot(String),

    #[error("privileged shell unavailable: {0}")]
    ShellUnavailable(String),

    #[error("could not parse device property {property}: {value:?}")]
    PropertyParse { property: String, value: String },

    // Safety errors (40-42)
    #[error("operation blocked by safety gate: {}", .issues.join("; "))]
    SafetyViolation { issues: Vec<String> },

    #[error("another device operation is already running")]
    ConcurrentOperation,

    // Execution errors (43-44)
    #[error("command `{command}` exited with status {exit_code}: {stderr}")]
    Execution {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("verification failed: {}", .issues.join("; "))]
    Verification {
        issues: Vec<String>,
        requires_recovery: bool,
    },

    // Integrity errors (45-49)
    #[error("checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("backup already exists: {name}")]
    BackupExists { name: String },

    #[error("backup not found: {name}")]
    BackupNotFound { name: String },

    #[error("image rejected: {0}")]
    InvalidImage(String),

    // Cancellation (50)
    #[error("operation cancelled before {stage}")]
    Cancelled { stage: String },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Probe errors
    /// - 41-42: Safety refusals
    /// - 43-44: Execution and verification errors
    /// - 45-49: Integrity errors
    /// - 50: Cancellation
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidPolicy(_) => 11,
            Error::InvalidLayout(_) => 12,
            Error::Probe(_) => 20,
            Error::NoRoot(_) => 21,
            Error::ShellUnavailable(_) => 22,
            Error::PropertyParse { .. } => 23,
            Error::SafetyViolation { .. } => 41,
            Error::ConcurrentOperation => 42,
            Error::Execution { .. } => 43,
            Error::Verification { .. } => 44,
            Error::ChecksumMismatch { .. } => 45,
            Error::BackupExists { .. } => 46,
            Error::BackupNotFound { .. } => 47,
            Error::InvalidImage(_) => 48,
            Error::Cancelled { .. } => 50,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidPolicy(_) | Error::InvalidLayout(_) => {
                ErrorCategory::Config
            }

            Error::Probe(_)
            | Error::NoRoot(_)
            | Error::ShellUnavailable(_)
            | Error::PropertyParse { .. } => ErrorCategory::Probe,

            Error::SafetyViolation { .. } | Error::ConcurrentOperation => ErrorCategory::Safety,

            Error::Execution { .. } | Error::Verification { .. } | Error::Cancelled { .. } => {
                ErrorCategory::Execution
            }

            Error::ChecksumMismatch { .. }
            | Error::BackupExists { .. }
            | Error::BackupNotFound { .. }
            | Error::InvalidImage(_) => ErrorCategory::Integrity,

            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether this error is potentially recoverable by the caller.
    ///
    /// Nothing here is retried automatically; a destructive step is only ever
    /// re-attempted through a fresh probe and gate.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) | Error::InvalidPolicy(_) | Error::InvalidLayout(_) => true,

            Error::Probe(_) => true,
            Error::NoRoot(_) => true, // Can grant root
            Error::ShellUnavailable(_) => false,
            Error::PropertyParse { .. } => true,

            Error::SafetyViolation { .. } => true, // Charge, free space, etc.
            Error::ConcurrentOperation => true,

            Error::Execution { .. } => false,
            Error::Verification {
                requires_recovery, ..
            } => !requires_recovery,

            Error::ChecksumMismatch { .. } => false,
            Error::BackupExists { .. } => true,
            Error::BackupNotFound { .. } => false,
            Error::InvalidImage(_) => true,

            Error::Cancelled { .. } => true,

            Error::Io(_) => true,
            Error::Json(_) => true,
        }
    }

    /// Returns the suggested action for agents.
    pub fn suggested_action(&self) -> SuggestedAction {
        match self {
            Error::Config(_) => SuggestedAction::RunCheck,
            Error::InvalidPolicy(_) | Error::InvalidLayout(_) => SuggestedAction::ResetConfig,

            Error::Probe(_) | Error::PropertyParse { .. } => SuggestedAction::Retry,
            Error::NoRoot(_) => SuggestedAction::Elevate,
            Error::ShellUnavailable(_) => SuggestedAction::Abort,

            Error::SafetyViolation { .. } => SuggestedAction::RunCheck,
            Error::ConcurrentOperation => SuggestedAction::Wait,

            Error::Execution { .. } => SuggestedAction::ManualRecovery,
            Error::Verification {
                requires_recovery: true,
                ..
            } => SuggestedAction::ManualRecovery,
            Error::Verification { .. } => SuggestedAction::RunCheck,

            Error::ChecksumMismatch { .. } => SuggestedAction::Redownload,
            Error::BackupExists { .. } => SuggestedAction::Retry,
            Error::BackupNotFound { .. } => SuggestedAction::Abort,
            Error::InvalidImage(_) => SuggestedAction::Redownload,

            Error::Cancelled { .. } => SuggestedAction::None,

            Error::Io(_) => SuggestedAction::Retry,
            Error::Json(_) => SuggestedAction::ResetConfig,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => {
                "Run 'romtools config validate' to check configuration files."
            }
            Error::InvalidPolicy(_) => {
                "Fix policy.json or remove it to fall back to built-in defaults."
            }
            Error::InvalidLayout(_) => {
                "Fix layout.json or remove it to fall back to built-in defaults."
            }

            Error::Probe(_) => "Reconnect the device and re-run 'romtools probe'.",
            Error::NoRoot(_) => {
                "Grant root access to romtools in your root manager and retry."
            }
            Error::ShellUnavailable(_) => {
                "No privileged shell could be started. Install a root solution that provides 'su'."
            }
            Error::PropertyParse { .. } => {
                "The device reported an unexpected property value. Retry the probe."
            }

            Error::SafetyViolation { .. } => {
                "Resolve the listed issues (charge the device, free storage) and re-run 'romtools check <op>'."
            }
            Error::ConcurrentOperation => {
                "Wait for the running operation to finish, then retry."
            }

            Error::Execution { .. } => {
                "A device command failed mid-operation. Check the device boots, and restore a backup from recovery if it does not."
            }
            Error::Verification { .. } => {
                "Post-operation verification failed. Boot into recovery and restore the most recent backup."
            }

            Error::ChecksumMismatch { .. } => {
                "Stored data no longer matches its checksum. Download the image again or pick another backup."
            }
            Error::BackupExists { .. } => "Choose a different backup name.",
            Error::BackupNotFound { .. } => {
                "List available backups with 'romtools backup list'."
            }
            Error::InvalidImage(_) => {
                "Verify the image file size and SHA-256 against the published values."
            }

            Error::Cancelled { .. } => "The operation was cancelled before touching the device.",

            Error::Io(_) => {
                "Check disk space, permissions, and that the backup and retention roots exist."
            }
            Error::Json(_) => "A JSON file is malformed. Check its syntax or restore it.",
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::InvalidPolicy(_) => "Invalid Policy Configuration",
            Error::InvalidLayout(_) => "Invalid Layout Configuration",

            Error::Probe(_) => "Capability Probe Failed",
            Error::NoRoot(_) => "Root Access Unavailable",
            Error::ShellUnavailable(_) => "Privileged Shell Unavailable",
            Error::PropertyParse { .. } => "Unexpected Device Property",

            Error::SafetyViolation { .. } => "Safety Check Failed",
            Error::ConcurrentOperation => "Operation Already Running",

            Error::Execution { .. } => "Device Command Failed",
            Error::Verification { .. } => "Verification Failed",

            Error::ChecksumMismatch { .. } => "Checksum Mismatch",
            Error::BackupExists { .. } => "Backup Already Exists",
            Error::BackupNotFound { .. } => "Backup Not Found",
            Error::InvalidImage(_) => "Invalid Image",

            Error::Cancelled { .. } => "Operation Cancelled",

            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Parse Error",
        }
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Suggested action for agents.
    pub suggested_action: SuggestedAction,

    /// Additional structured context (e.g., partition, backup name).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::PropertyParse { property, value } => {
                context.insert("property".to_string(), serde_json::json!(property));
                context.insert("value".to_string(), serde_json::json!(value));
            }
            Error::SafetyViolation { issues } => {
                context.insert("issues".to_string(), serde_json::json!(issues));
            }
            Error::Execution {
                command, exit_code, ..
            } => {
                context.insert("command".to_string(), serde_json::json!(command));
                context.insert("exit_code".to_string(), serde_json::json!(exit_code));
            }
            Error::Verification {
                issues,
                requires_recovery,
            } => {
                context.insert("issues".to_string(), serde_json::json!(issues));
                context.insert(
                    "requires_recovery".to_string(),
                    serde_json::json!(requires_recovery),
                );
            }
            Error::ChecksumMismatch { subject, .. } => {
                context.insert("subject".to_string(), serde_json::json!(subject));
            }
            Error::BackupExists { name } | Error::BackupNotFound { name } => {
                context.insert("backup".to_string(), serde_json::json!(name));
            }
            Error::Cancelled { stage } => {
                context.insert("stage".to_string(), serde_json::json!(stage));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            suggested_action: err.suggested_action(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}

/// Format an error for human-readable stderr output.
///
/// ```text
/// ✗ [Headline]
///   Reason: [Error message]
///   Fix: [Remediation hint]
/// ```
pub fn format_error_human(err: &Error, use_color: bool) -> String {
    let (red, cyan, reset) = if use_color {
        ("\x1b[31m", "\x1b[36m", "\x1b[0m")
    } else {
        ("", "", "")
    };

    format!(
        "{red}✗{reset} {headline}\n  Reason: {message}\n  {cyan}Fix:{reset} {remediation}",
        red = red,
        cyan = cyan,
        reset = reset,
        headline = err.headline(),
        message = err,
        remediation = err.remediation()
    )
}
