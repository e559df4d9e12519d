//! Structured event definitions for logging.
//!
//! Every event carries the run id and the pipeline stage so a JSONL log of a
//! failed flash can be replayed step by step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Where in a run an event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup and configuration.
    Init,
    /// Capability probe and status refresh.
    Probe,
    /// Safety gate evaluation.
    Gate,
    /// Pre-operation or on-demand partition backup.
    Backup,
    /// Destructive step.
    Execute,
    /// Post-operation verification.
    Verify,
    /// Restore from backup after a failed verification.
    Rollback,
    /// Host-app retention staging and restore.
    Retention,
    /// Image download.
    Download,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Probe => "probe",
            Stage::Gate => "gate",
            Stage::Backup => "backup",
            Stage::Execute => "execute",
            Stage::Verify => "verify",
            Stage::Rollback => "rollback",
            Stage::Retention => "retention",
            Stage::Download => "download",
        };
        f.write_str(s)
    }
}

/// Standard event names used as tracing targets.
pub mod event_names {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_FINISHED: &str = "run.finished";
    pub const RUN_CANCELLED: &str = "run.cancelled";
    pub const RUN_ABORTED: &str = "run.aborted";

    pub const PROBE_STARTED: &str = "probe.started";
    pub const PROBE_FINISHED: &str = "probe.finished";
    pub const PROBE_FAILED: &str = "probe.failed";
    pub const STATUS_REFRESHED: &str = "status.refreshed";

    pub const GATE_PASSED: &str = "gate.passed";
    pub const GATE_WARNED: &str = "gate.warned";
    pub const GATE_BLOCKED: &str = "gate.blocked";

    pub const BACKUP_STARTED: &str = "backup.started";
    pub const BACKUP_FINISHED: &str = "backup.finished";
    pub const BACKUP_RESTORED: &str = "backup.restored";

    pub const EXECUTE_STARTED: &str = "execute.started";
    pub const EXECUTE_FAILED: &str = "execute.failed";
    pub const EXECUTE_FINISHED: &str = "execute.finished";

    pub const VERIFY_RESULT: &str = "verify.result";

    pub const ROLLBACK_STARTED: &str = "rollback.started";
    pub const ROLLBACK_FINISHED: &str = "rollback.finished";

    pub const RETENTION_STAGED: &str = "retention.staged";
    pub const RETENTION_RESTORED: &str = "retention.restored";

    pub const DOWNLOAD_RESUMED: &str = "download.resumed";
    pub const DOWNLOAD_FINISHED: &str = "download.finished";
}

/// A structured log event for JSONL output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub ts: DateTime<Utc>,
    pub level: Level,
    /// Event name (e.g., "probe.started", "gate.blocked").
    pub event: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl LogEvent {
    pub fn with_field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(key.into(), v);
        }
        self
    }

    /// Serialize to a single JSON line.
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"serialization_failed","event":"{}"}}"#,
                self.event
            )
        })
    }
}

/// Correlation ids shared by every event of one run.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub run_id: String,
    pub operation: Option<String>,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        LogContext {
            run_id: run_id.into(),
            operation: None,
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn event(
        &self,
        level: Level,
        event: impl Into<String>,
        stage: Stage,
        message: impl Into<String>,
    ) -> LogEvent {
        LogEvent {
            ts: Utc::now(),
            level,
            event: event.into(),
            run_id: self.run_id.clone(),
            operation: self.operation.clone(),
            stage,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn info(&self, event: impl Into<String>, stage: Stage, message: impl Into<String>) -> LogEvent {
        self.event(Level::Info, event, stage, message)
    }

    pub fn warn(&self, event: impl Into<String>, stage: Stage, message: impl Into<String>) -> LogEvent {
        self.event(Level::Warn, event, stage, message)
    }
}
