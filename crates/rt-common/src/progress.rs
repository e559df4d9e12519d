//! Progress records pushed to observers.

use crate::operation::OperationKind;
use serde::{Deserialize, Serialize};

/// One progress step of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationProgress {
    pub operation: OperationKind,
    /// In `[0, 100]`; strictly increasing within a run, exactly 100 only on success.
    pub progress_percent: f64,
    pub stage: String,
}

/// Download state pushed after every confirmed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    /// `None` when the source did not report a length.
    pub total_bytes: Option<u64>,
    pub bytes_per_second: f64,
    pub is_completed: bool,
    /// Offset the transfer resumed from, 0 for a fresh download.
    pub resumed_from: u64,
}

impl DownloadProgress {
    /// Fraction in `0.0..=1.0`, or `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_downloaded as f64 / total as f64).clamp(0.0, 1.0)),
            None => None,
        }
    }
}
