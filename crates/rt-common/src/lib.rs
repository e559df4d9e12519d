//! romtools common types, IDs, and errors.
//!
//! This crate provides the data model shared by the rt-core modules:
//! - Device capabilities and live safety status
//! - Operation kinds with their static requirements
//! - Safety, validation, backup, retention, and progress records
//! - The unified error taxonomy with stable codes
//! - Output formats

pub mod backup;
pub mod device;
pub mod error;
pub mod id;
pub mod operation;
pub mod output;
pub mod progress;
pub mod retention;
pub mod safety;
pub mod validation;

pub use backup::BackupInfo;
pub use device::{
    BootloaderSafetyStatus, Capability, DeviceCapabilities, SelinuxMode, VerifiedBootState,
};
pub use error::{
    format_error_human, Error, ErrorCategory, Result, StructuredError, SuggestedAction,
};
pub use id::{BackupName, InvalidBackupName, RunId};
pub use operation::{OperationKind, OperationRequirements};
pub use output::OutputFormat;
pub use progress::{DownloadProgress, OperationProgress};
pub use retention::{RetentionMechanism, RetentionStatus};
pub use safety::SafetyCheckResult;
pub use validation::{ValidationResult, CRITICAL_MARKER};

/// Version of the JSON documents written by romtools (manifests, reports).
pub const SCHEMA_VERSION: &str = "1.0.0";
