//! Push-only progress reporting.
//!
//! Producers hand [`ProgressEvent`]s to a [`ProgressSink`]; there is no pull
//! API. Sinks fan out to an in-process [`EventBus`], a JSONL stream, or
//! several of those at once.

use chrono::{DateTime, Utc};
use rt_common::{DownloadProgress, OperationKind, OperationProgress};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{mpsc, Arc, Mutex};

/// Standard progress event names.
pub mod event_names {
    pub const OPERATION_PROGRESS: &str = "operation_progress";
    pub const OPERATION_COMPLETE: &str = "operation_complete";
    pub const DOWNLOAD_PROGRESS: &str = "download_progress";
    pub const DOWNLOAD_COMPLETE: &str = "download_complete";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressPayload {
    Operation(OperationProgress),
    Download(DownloadProgress),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub payload: ProgressPayload,
}

impl ProgressEvent {
    pub fn operation(progress: OperationProgress) -> Self {
        let event = if progress.progress_percent >= 100.0 {
            event_names::OPERATION_COMPLETE
        } else {
            event_names::OPERATION_PROGRESS
        };
        Self {
            event: event.to_string(),
            timestamp: Utc::now(),
            run_id: None,
            payload: ProgressPayload::Operation(progress),
        }
    }

    pub fn download(progress: DownloadProgress) -> Self {
        let event = if progress.is_completed {
            event_names::DOWNLOAD_COMPLETE
        } else {
            event_names::DOWNLOAD_PROGRESS
        };
        Self {
            event: event.to_string(),
            timestamp: Utc::now(),
            run_id: None,
            payload: ProgressPayload::Download(progress),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn as_operation(&self) -> Option<&OperationProgress> {
        match &self.payload {
            ProgressPayload::Operation(p) => Some(p),
            ProgressPayload::Download(_) => None,
        }
    }

    pub fn as_download(&self) -> Option<&DownloadProgress> {
        match &self.payload {
            ProgressPayload::Download(p) => Some(p),
            ProgressPayload::Operation(_) => None,
        }
    }

    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"serialization_failed","event":"{}"}}"#,
                self.event
            )
        })
    }
}

/// Receiver of progress events.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Broadcast bus supporting multiple subscribers. Disconnected subscribers
/// are dropped on the next emit.
#[derive(Debug, Default)]
pub struct EventBus {
    senders: Mutex<Vec<mpsc::Sender<ProgressEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        rx
    }
}

impl ProgressSink for EventBus {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.retain(|sender| sender.send(event.clone()).is_ok());
        }
    }
}

/// One JSON object per line.
pub struct JsonlWriter<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonlWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> ProgressSink for JsonlWriter<W> {
    fn emit(&self, event: ProgressEvent) {
        let line = event.to_jsonl();
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", line);
            let _ = writer.flush();
        }
    }
}

pub struct FanoutSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }
}

impl ProgressSink for FanoutSink {
    fn emit(&self, event: ProgressEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Stamps every event with a run id before forwarding.
pub struct RunSink {
    run_id: String,
    inner: Arc<dyn ProgressSink>,
}

impl RunSink {
    pub fn new(run_id: impl Into<String>, inner: Arc<dyn ProgressSink>) -> Self {
        Self {
            run_id: run_id.into(),
            inner,
        }
    }
}

impl ProgressSink for RunSink {
    fn emit(&self, mut event: ProgressEvent) {
        if event.run_id.is_none() {
            event.run_id = Some(self.run_id.clone());
        }
        self.inner.emit(event);
    }
}

/// Enforces the progress contract for one run: values are clamped to
/// `[0, 100)`, strictly increasing, and 100 is only ever emitted by
/// [`ProgressTracker::complete`].
pub struct ProgressTracker<'a> {
    operation: OperationKind,
    sink: &'a dyn ProgressSink,
    run_id: Option<String>,
    last: Option<f64>,
}

/// Highest value reachable before completion.
const MAX_BEFORE_COMPLETE: f64 = 99.0;

impl<'a> ProgressTracker<'a> {
    pub fn new(operation: OperationKind, sink: &'a dyn ProgressSink) -> Self {
        Self {
            operation,
            sink,
            run_id: None,
            last: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Emit `percent` for `stage` if it moves progress forward. Returns
    /// whether an event was emitted.
    pub fn advance(&mut self, stage: &str, percent: f64) -> bool {
        if !percent.is_finite() {
            return false;
        }
        let percent = percent.clamp(0.0, MAX_BEFORE_COMPLETE);
        if self.last.is_some_and(|last| percent <= last) {
            return false;
        }
        self.emit(stage, percent);
        true
    }

    /// Map `fraction` of a sub-step onto the `[from, to]` band.
    pub fn advance_within(&mut self, stage: &str, from: f64, to: f64, fraction: f64) -> bool {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.advance(stage, from + (to - from) * fraction)
    }

    /// Terminal success.
    pub fn complete(&mut self, stage: &str) {
        if self.last != Some(100.0) {
            self.emit(stage, 100.0);
        }
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }

    fn emit(&mut self, stage: &str, percent: f64) {
        self.last = Some(percent);
        let mut event = ProgressEvent::operation(OperationProgress {
            operation: self.operation,
            progress_percent: percent,
            stage: stage.to_string(),
        });
        event.run_id = self.run_id.clone();
        self.sink.emit(event);
    }
}
