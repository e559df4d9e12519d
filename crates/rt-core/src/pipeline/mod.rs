//! The operation pipeline.
//!
//! A run walks `Idle → Probing → Gating → Executing → Verifying` and ends in
//! exactly one terminal state:
//!
//! - `Blocked`: the gate refused; no privileged command was issued for the
//!   operation itself.
//! - `Completed`: the operation ran and verified.
//! - `Failed`: execution or verification failed. When recovery is required
//!   and a covering backup exists, `RollingBack` comes first; a rollback
//!   never turns the run into a success.
//! - `Cancelled`: the token was set at a stage boundary.
//!
//! Device state is re-read and re-gated immediately before the mutating
//! step, so a status taken before a long backup never authorizes the write.

mod lock;
mod state;

pub use lock::{LockError, RunGuard, RunLock};
pub use state::{
    OperationOutcome, OperationRequest, PipelineState, RetentionReport, RollbackReport,
    RunReport, WarningAcknowledgement,
};

use crate::backup::BackupManager;
use crate::bootloader::BootloaderControl;
use crate::cancel::CancellationToken;
use crate::events::{ProgressSink, ProgressTracker};
use crate::flash::{FlashManager, FlashReport, ImageFile};
use crate::log_event;
use crate::logging::{event_names, LogContext, Stage};
use crate::partition::validate_partition_name;
use crate::probe::{CapabilityProbe, ProbeError, StatusProvider};
use crate::retention::RetentionManager;
use crate::safety::{GateContext, SafetyGate};
use crate::verify::Verifier;
use rt_common::{
    BackupInfo, BackupName, BootloaderSafetyStatus, DeviceCapabilities, OperationKind, RunId,
    SafetyCheckResult, ValidationResult, CRITICAL_MARKER,
};
use rt_config::{BackupPolicy, Policy};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Errors that prevent a run from producing an outcome.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("another device operation is already running")]
    ConcurrentOperation,

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Lock(LockError),

    #[error("operation worker has stopped")]
    WorkerGone,
}

impl From<LockError> for PipelineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held => PipelineError::ConcurrentOperation,
            other => PipelineError::Lock(other),
        }
    }
}

impl From<PipelineError> for rt_common::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::ConcurrentOperation => rt_common::Error::ConcurrentOperation,
            PipelineError::Probe(e) => e.into(),
            PipelineError::InvalidRequest(msg) => rt_common::Error::Config(msg),
            PipelineError::Lock(LockError::Io { source, .. }) => rt_common::Error::Io(source),
            PipelineError::Lock(LockError::Held) => rt_common::Error::ConcurrentOperation,
            PipelineError::WorkerGone => {
                rt_common::Error::Io(std::io::Error::other("operation worker has stopped"))
            }
        }
    }
}

/// The managers a pipeline delegates to. Built once by the composition root.
#[derive(Clone)]
pub struct PipelineParts {
    pub probe: Arc<dyn CapabilityProbe>,
    pub status: Arc<dyn StatusProvider>,
    pub gate: Arc<dyn SafetyGate>,
    pub backups: Arc<dyn BackupManager>,
    pub flash: Arc<FlashManager>,
    pub bootloader: Arc<dyn BootloaderControl>,
    pub retention: Arc<dyn RetentionManager>,
    pub verifier: Arc<Verifier>,
}

pub struct OperationPipeline {
    parts: PipelineParts,
    backup_policy: BackupPolicy,
    max_status_age_ms: u64,
    lock: RunLock,
}

impl OperationPipeline {
    pub fn new(parts: PipelineParts, policy: &Policy, lock: RunLock) -> Self {
        Self {
            parts,
            backup_policy: policy.backup.clone(),
            max_status_age_ms: policy.safety.max_status_age_ms,
            lock,
        }
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    pub fn parts(&self) -> &PipelineParts {
        &self.parts
    }

    /// Take the run lock and run `request` to a terminal outcome.
    pub fn run(
        &self,
        request: &OperationRequest,
        ack: WarningAcknowledgement,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let guard = self.lock.try_acquire()?;
        self.run_locked(&guard, request, ack, sink, cancel)
    }

    /// Run with a lock the caller already holds.
    pub fn run_locked(
        &self,
        _guard: &RunGuard,
        request: &OperationRequest,
        ack: WarningAcknowledgement,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let run_id = RunId::new();
        let ctx = LogContext::new(run_id.to_string()).with_operation(request.kind.as_str());
        if let Err(err) = validate_request(request) {
            log_aborted(&ctx, &err);
            return Err(err);
        }
        let mut run = Run {
            ctx,
            run_id: run_id.clone(),
            request,
            ack,
            tracker: ProgressTracker::new(request.kind, sink).with_run_id(run_id.to_string()),
            cancel,
            transitions: vec![PipelineState::Idle],
            capabilities: None,
            safety: None,
        };
        log_event!(
            run.ctx,
            INFO,
            event_names::RUN_STARTED,
            Stage::Init,
            "run started",
            retain = request.retain,
            acknowledged = ack.is_acknowledged()
        );

        let outcome = match self.drive(&mut run) {
            Ok(outcome) => outcome,
            Err(err) => {
                log_aborted(&run.ctx, &err);
                return Err(err);
            }
        };
        let terminal = outcome.state();
        run.transitions.push(terminal);
        log_event!(
            run.ctx,
            INFO,
            event_names::RUN_FINISHED,
            Stage::Init,
            format!("run finished: {}", terminal),
            issues = outcome.issues().len()
        );

        Ok(RunReport {
            run_id,
            operation: request.kind,
            transitions: run.transitions,
            capabilities: run.capabilities,
            safety: run.safety,
            outcome,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn drive(&self, run: &mut Run<'_>) -> Result<OperationOutcome, PipelineError> {
        let kind = run.request.kind;

        if let Some(cancelled) = run.checkpoint("probing", Stage::Probe) {
            return Ok(cancelled);
        }
        run.enter(PipelineState::Probing);
        run.tracker.advance("probing", 5.0);
        log_event!(run.ctx, INFO, event_names::PROBE_STARTED, Stage::Probe, "probing device");
        let capabilities = self.parts.probe.probe()?;
        let status = self.parts.status.refresh()?;
        log_event!(
            run.ctx,
            INFO,
            event_names::PROBE_FINISHED,
            Stage::Probe,
            "device probed",
            model = capabilities.device_model.as_str(),
            battery = status.battery_level_percent,
            unlocked = status.is_bootloader_unlocked
        );
        run.capabilities = Some(capabilities.clone());

        if let Some(cancelled) = run.checkpoint("gating", Stage::Gate) {
            return Ok(cancelled);
        }
        run.enter(PipelineState::Gating);
        run.tracker.advance("gating", 15.0);
        let affected = self.affected_partitions(run.request);
        let existing_backup = self.covering_backup(&run.ctx, &affected);
        let image_size = run.request.image.as_ref().map(|i| i.size_bytes);
        let safety = self.parts.gate.evaluate(
            kind,
            &capabilities,
            &status,
            &GateContext {
                image_size,
                backup_exists: existing_backup.is_some(),
            },
        );
        if let Some(blocked) = run.decide(safety) {
            return Ok(blocked);
        }

        run.enter(PipelineState::Executing);

        let mut image = None;
        if let Some(requested) = &run.request.image {
            if let Some(cancelled) = run.checkpoint("image verification", Stage::Execute) {
                return Ok(cancelled);
            }
            match requested.verify(self.parts.flash.buffer_bytes()) {
                Ok(sha256) => image = Some(requested.clone().with_digest(sha256)),
                Err(e) => {
                    return Ok(failed(vec![format!("Image verification failed: {}", e)], false));
                }
            }
        }

        let mut created_backup = None;
        if self.wants_backup(run.request, &affected) {
            if let Some(cancelled) = run.checkpoint("backup", Stage::Backup) {
                return Ok(cancelled);
            }
            run.tracker.advance("backup", 25.0);
            let name = match &run.request.backup_name {
                Some(name) => name.clone(),
                None => match self.auto_backup_name(&run.run_id) {
                    Ok(name) => name,
                    Err(issue) => return Ok(failed(vec![issue], false)),
                },
            };
            log_event!(
                run.ctx,
                INFO,
                event_names::BACKUP_STARTED,
                Stage::Backup,
                format!("backing up {}", affected.join(", ")),
                name = name.as_str()
            );
            match self
                .parts
                .backups
                .create_backup(&name, &affected, &capabilities)
            {
                Ok(info) => {
                    log_event!(
                        run.ctx,
                        INFO,
                        event_names::BACKUP_FINISHED,
                        Stage::Backup,
                        "backup created",
                        name = info.name.as_str(),
                        size_bytes = info.size_bytes
                    );
                    created_backup = Some(info);
                }
                Err(e) => {
                    return Ok(failed(
                        vec![format!("Pre-operation backup failed: {}", e)],
                        false,
                    ));
                }
            }
            run.tracker.advance("backup", 40.0);
        }

        let mut retention = None;
        if run.request.retain && mutates_device(kind) {
            if let Some(cancelled) = run.checkpoint("retention", Stage::Retention) {
                return Ok(cancelled);
            }
            run.tracker.advance("retention", 45.0);
            let mut report = RetentionReport::default();
            match self.parts.retention.setup_retention() {
                Ok(status) => {
                    log_event!(
                        run.ctx,
                        INFO,
                        event_names::RETENTION_STAGED,
                        Stage::Retention,
                        "retention staged",
                        succeeded = status.success_count()
                    );
                    report.staged = Some(status);
                }
                Err(e) => {
                    log_event!(
                        run.ctx,
                        WARN,
                        event_names::RETENTION_STAGED,
                        Stage::Retention,
                        format!("retention setup failed: {}", e)
                    );
                    report.errors.push(format!("Retention setup failed: {}", e));
                }
            }
            retention = Some(report);
        }

        if mutates_device(kind) {
            if let Some(cancelled) = run.checkpoint("pre-write gate", Stage::Gate) {
                return Ok(cancelled);
            }
            let status = match self.fresh_status() {
                Ok(status) => status,
                Err(issue) => return Ok(failed(vec![issue], false)),
            };
            log_event!(
                run.ctx,
                DEBUG,
                event_names::STATUS_REFRESHED,
                Stage::Gate,
                "status refreshed before write",
                battery = status.battery_level_percent
            );
            let safety = self.parts.gate.evaluate(
                kind,
                &capabilities,
                &status,
                &GateContext {
                    image_size,
                    backup_exists: created_backup.is_some() || existing_backup.is_some(),
                },
            );
            if let Some(blocked) = run.decide(safety) {
                return Ok(blocked);
            }
        }

        run.tracker.advance("executing", 50.0);
        log_event!(run.ctx, INFO, event_names::EXECUTE_STARTED, Stage::Execute, "executing");
        let executed = self.execute(run, image.as_ref());
        let flash_report = match executed {
            Ok(report) => report,
            Err(msg) => {
                log_event!(
                    run.ctx,
                    ERROR,
                    event_names::EXECUTE_FAILED,
                    Stage::Execute,
                    msg.as_str()
                );
                let issues = vec![format!("{} {} failed: {}", CRITICAL_MARKER, kind, msg)];
                let requires_recovery = mutates_device(kind) && kind != OperationKind::BootImage;
                run.enter(PipelineState::Verifying);
                return Ok(self.recover(run, issues, requires_recovery, created_backup, &affected));
            }
        };

        run.enter(PipelineState::Verifying);
        run.tracker.advance("verifying", 90.0);
        let validation = self.verify(kind, flash_report.as_ref());
        let verdict = if validation.success {
            "verified"
        } else {
            "verification failed"
        };
        log_event!(
            run.ctx,
            INFO,
            event_names::VERIFY_RESULT,
            Stage::Verify,
            verdict,
            success = validation.success,
            requires_recovery = validation.requires_recovery
        );
        if !validation.success {
            return Ok(self.recover(
                run,
                validation.issues,
                validation.requires_recovery,
                created_backup,
                &affected,
            ));
        }

        if let Some(report) = retention.as_mut().filter(|r| r.staged.is_some()) {
            run.tracker.advance("retention", 95.0);
            match self.parts.retention.restore_after_flash() {
                Ok(restored) => {
                    log_event!(
                        run.ctx,
                        INFO,
                        event_names::RETENTION_RESTORED,
                        Stage::Retention,
                        "host app restored",
                        data_restored = restored.data_restored
                    );
                    report.restored = Some(restored);
                }
                Err(e) => {
                    log_event!(
                        run.ctx,
                        WARN,
                        event_names::RETENTION_RESTORED,
                        Stage::Retention,
                        format!("restore after flash failed: {}", e)
                    );
                    report.errors.push(format!("Restore after flash failed: {}", e));
                }
            }
        }

        run.tracker.complete("completed");
        log_event!(run.ctx, INFO, event_names::EXECUTE_FINISHED, Stage::Execute, "operation completed");
        let acknowledged_warnings = run
            .safety
            .as_ref()
            .map(|s| s.warnings.clone())
            .unwrap_or_default();
        Ok(OperationOutcome::Completed {
            backup: created_backup,
            flash: flash_report,
            retention,
            acknowledged_warnings,
        })
    }

    /// The mutating step. No cancellation point inside.
    fn execute(&self, run: &mut Run<'_>, image: Option<&ImageFile>) -> Result<Option<FlashReport>, String> {
        let kind = run.request.kind;
        match kind {
            OperationKind::Check => Ok(None),
            OperationKind::Unlock => self
                .parts
                .bootloader
                .unlock()
                .map(|_| None)
                .map_err(|e| e.to_string()),
            OperationKind::Lock => self
                .parts
                .bootloader
                .lock()
                .map(|_| None)
                .map_err(|e| e.to_string()),
            OperationKind::BootImage => {
                let image = image.ok_or_else(|| "no image to boot".to_string())?;
                self.parts
                    .bootloader
                    .boot_image(image)
                    .map(|_| None)
                    .map_err(|e| e.to_string())
            }
            OperationKind::FlashPartition | OperationKind::FlashRecovery => {
                let image = image.ok_or_else(|| "no image to flash".to_string())?;
                let partition = run
                    .request
                    .target_partition()
                    .ok_or_else(|| "no target partition".to_string())?;
                let tracker = &mut run.tracker;
                self.parts
                    .flash
                    .flash(image, &partition, &mut |written, total| {
                        let fraction = written as f64 / total.max(1) as f64;
                        tracker.advance_within("flashing", 50.0, 85.0, fraction);
                    })
                    .map(Some)
                    .map_err(|e| e.to_string())
            }
        }
    }

    fn verify(&self, kind: OperationKind, flash: Option<&FlashReport>) -> ValidationResult {
        match kind {
            OperationKind::FlashPartition | OperationKind::FlashRecovery => match flash {
                Some(report) => self.parts.verifier.readback(
                    &report.partition,
                    report.bytes_written,
                    &report.sha256,
                ),
                None => ValidationResult::from_issues(vec![format!(
                    "{} flash reported no written image",
                    CRITICAL_MARKER
                )]),
            },
            OperationKind::Unlock | OperationKind::Lock => match self.parts.status.refresh() {
                Ok(status) => Verifier::lock_state(kind, &status),
                Err(e) => ValidationResult::from_issues(vec![format!(
                    "Could not confirm bootloader state after {}: {}",
                    kind, e
                )]),
            },
            OperationKind::Check | OperationKind::BootImage => ValidationResult::ok(),
        }
    }

    /// Route a failure through rollback when recovery is required and a
    /// covering backup exists. The result is always `Failed`.
    fn recover(
        &self,
        run: &mut Run<'_>,
        issues: Vec<String>,
        requires_recovery: bool,
        created_backup: Option<BackupInfo>,
        affected: &[String],
    ) -> OperationOutcome {
        if !requires_recovery || affected.is_empty() {
            return failed(issues, requires_recovery);
        }
        let backup = created_backup.or_else(|| self.covering_backup(&run.ctx, affected));
        let Some(backup) = backup else {
            log_event!(
                run.ctx,
                WARN,
                event_names::ROLLBACK_STARTED,
                Stage::Rollback,
                format!("no backup covers {}; manual recovery required", affected.join(", "))
            );
            return failed(issues, true);
        };

        run.enter(PipelineState::RollingBack);
        log_event!(
            run.ctx,
            WARN,
            event_names::ROLLBACK_STARTED,
            Stage::Rollback,
            "restoring backup",
            backup = backup.name.as_str()
        );
        let rollback = match self.parts.backups.restore(&backup) {
            Ok(result) => RollbackReport {
                backup: backup.name.clone(),
                restored: result.success,
                issues: result.issues,
            },
            Err(e) => RollbackReport {
                backup: backup.name.clone(),
                restored: false,
                issues: vec![format!("Rollback could not start: {}", e)],
            },
        };
        let verdict = if rollback.restored {
            "backup restored"
        } else {
            "rollback incomplete"
        };
        log_event!(
            run.ctx,
            INFO,
            event_names::ROLLBACK_FINISHED,
            Stage::Rollback,
            verdict,
            restored = rollback.restored
        );
        OperationOutcome::Failed {
            issues,
            requires_recovery: !rollback.restored,
            rollback: Some(rollback),
        }
    }

    /// Partitions a run of `request` may change.
    pub fn affected_partitions(&self, request: &OperationRequest) -> Vec<String> {
        match request.kind {
            OperationKind::Unlock | OperationKind::Lock => {
                self.backup_policy.bootloader_partitions.clone()
            }
            OperationKind::FlashPartition | OperationKind::FlashRecovery => {
                request.target_partition().into_iter().collect()
            }
            OperationKind::Check | OperationKind::BootImage => Vec::new(),
        }
    }

    fn wants_backup(&self, request: &OperationRequest, affected: &[String]) -> bool {
        !affected.is_empty()
            && (request.backup_name.is_some() || self.backup_policy.auto_backup)
    }

    fn covering_backup(&self, ctx: &LogContext, affected: &[String]) -> Option<BackupInfo> {
        if affected.is_empty() {
            return None;
        }
        match self.parts.backups.find_covering(affected) {
            Ok(found) => found,
            Err(e) => {
                log_event!(
                    ctx,
                    WARN,
                    event_names::BACKUP_STARTED,
                    Stage::Backup,
                    format!("could not list backups: {}", e)
                );
                None
            }
        }
    }

    fn auto_backup_name(&self, run_id: &RunId) -> Result<BackupName, String> {
        BackupName::new(format!("{}-{}", self.backup_policy.name_prefix, run_id))
            .map_err(|e| format!("Cannot name the pre-operation backup: {}", e))
    }

    /// Refresh status and refuse one older than the configured bound.
    fn fresh_status(&self) -> Result<BootloaderSafetyStatus, String> {
        let status = self
            .parts
            .status
            .refresh()
            .map_err(|e| format!("Could not refresh device status: {}", e))?;
        let age_ms = chrono::Utc::now()
            .timestamp_millis()
            .saturating_sub(status.last_checked_at_epoch_ms)
            .unsigned_abs();
        if age_ms > self.max_status_age_ms {
            return Err(format!(
                "Device status is {} ms old (limit {} ms); refusing to authorize the operation",
                age_ms, self.max_status_age_ms
            ));
        }
        Ok(status)
    }
}

/// Per-run bookkeeping.
struct Run<'a> {
    ctx: LogContext,
    run_id: RunId,
    request: &'a OperationRequest,
    ack: WarningAcknowledgement,
    tracker: ProgressTracker<'a>,
    cancel: &'a CancellationToken,
    transitions: Vec<PipelineState>,
    capabilities: Option<DeviceCapabilities>,
    safety: Option<SafetyCheckResult>,
}

impl Run<'_> {
    fn enter(&mut self, state: PipelineState) {
        tracing::debug!(run_id = %self.ctx.run_id, state = %state, "state transition");
        self.transitions.push(state);
    }

    fn checkpoint(&self, stage: &str, log_stage: Stage) -> Option<OperationOutcome> {
        if !self.cancel.is_cancelled() {
            return None;
        }
        log_event!(
            self.ctx,
            WARN,
            event_names::RUN_CANCELLED,
            log_stage,
            format!("cancelled before {}", stage)
        );
        Some(OperationOutcome::Cancelled {
            stage: stage.to_string(),
        })
    }

    /// Record a gate result; `Some` when the run must stop.
    fn decide(&mut self, safety: SafetyCheckResult) -> Option<OperationOutcome> {
        self.safety = Some(safety.clone());
        if !safety.passed {
            log_event!(
                self.ctx,
                WARN,
                event_names::GATE_BLOCKED,
                Stage::Gate,
                "blocked by critical issues",
                issues = safety.critical_issues.len()
            );
            return Some(OperationOutcome::Blocked {
                issues: safety.critical_issues.clone(),
                safety,
            });
        }
        if !safety.allows(self.ack.is_acknowledged()) {
            log_event!(
                self.ctx,
                WARN,
                event_names::GATE_BLOCKED,
                Stage::Gate,
                "warnings not acknowledged",
                warnings = safety.warnings.len()
            );
            let mut issues = safety.warnings.clone();
            issues.push("Warnings must be acknowledged before proceeding".to_string());
            return Some(OperationOutcome::Blocked { issues, safety });
        }
        if safety.warnings.is_empty() {
            log_event!(self.ctx, INFO, event_names::GATE_PASSED, Stage::Gate, "gate passed");
        } else {
            log_event!(
                self.ctx,
                INFO,
                event_names::GATE_WARNED,
                Stage::Gate,
                "proceeding with acknowledged warnings",
                warnings = safety.warnings.len()
            );
        }
        None
    }
}

fn failed(issues: Vec<String>, requires_recovery: bool) -> OperationOutcome {
    OperationOutcome::Failed {
        issues,
        requires_recovery,
        rollback: None,
    }
}

/// Everything except a read-only check touches the device.
fn mutates_device(kind: OperationKind) -> bool {
    kind != OperationKind::Check
}

/// A run that ends in an error rather than an outcome.
fn log_aborted(ctx: &LogContext, err: &PipelineError) {
    let message = format!("run aborted: {}", err);
    match err {
        PipelineError::Probe(_) => {
            log_event!(ctx, ERROR, event_names::PROBE_FAILED, Stage::Probe, message)
        }
        PipelineError::InvalidRequest(_) => {
            log_event!(ctx, WARN, event_names::RUN_ABORTED, Stage::Init, message)
        }
        _ => log_event!(ctx, ERROR, event_names::RUN_ABORTED, Stage::Init, message),
    }
}

fn validate_request(request: &OperationRequest) -> Result<(), PipelineError> {
    let kind = request.kind;
    let needs_image = kind.writes_image() || kind == OperationKind::BootImage;
    if needs_image && request.image.is_none() {
        return Err(PipelineError::InvalidRequest(format!(
            "{} requires an image",
            kind
        )));
    }
    if kind == OperationKind::FlashPartition && request.partition.is_none() {
        return Err(PipelineError::InvalidRequest(
            "flash_partition requires a target partition".to_string(),
        ));
    }
    if let Some(partition) = request.target_partition() {
        validate_partition_name(&partition)
            .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;
    }
    Ok(())
}
