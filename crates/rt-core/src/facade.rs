//! Composition root.
//!
//! [`RomTools`] owns one instance of every manager and hands the pipeline
//! trait objects. Operations that touch partitions or the host app take the
//! same run lock as pipeline runs, so nothing here races a flash.

use crate::backup::FileBackupManager;
use crate::bootloader::ShellBootloader;
use crate::cancel::CancellationToken;
use crate::events::ProgressSink;
use crate::flash::{DownloadReport, FlashManager, ImageSource};
use crate::partition::{BlockDevicePartitions, PartitionStore};
use crate::pipeline::{
    OperationPipeline, OperationRequest, PipelineError, PipelineParts, RunLock, RunReport,
    WarningAcknowledgement,
};
use crate::probe::{ShellCapabilityProbe, ShellStatusProvider};
use crate::retention::{ArtifactRetention, RestoreReport};
use crate::safety::{GateContext, PolicySafetyGate};
use crate::shell::{PrivilegedShell, SuShell};
use crate::verify::Verifier;
use crate::worker::{OperationHandle, OperationWorker};
use rt_common::{
    BackupInfo, BackupName, DeviceCapabilities, Result, RetentionStatus,
    SafetyCheckResult, ValidationResult,
};
use rt_config::Config;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct RomTools {
    config: Config,
    pipeline: Arc<OperationPipeline>,
    worker: OperationWorker,
}

impl RomTools {
    /// Wire every manager over `shell` and `partitions`.
    pub fn new(
        config: Config,
        shell: Arc<dyn PrivilegedShell>,
        partitions: Arc<dyn PartitionStore>,
    ) -> Result<Self> {
        let policy = &config.policy;
        let layout = &config.layout;
        let buffer = policy.backup.io_buffer_bytes;

        let parts = PipelineParts {
            probe: Arc::new(ShellCapabilityProbe::new(
                Arc::clone(&shell),
                layout.partition_dir.clone(),
            )),
            status: Arc::new(ShellStatusProvider::new(
                Arc::clone(&shell),
                policy.safety.clone(),
                layout.backup_root.clone(),
            )),
            gate: Arc::new(PolicySafetyGate::new(policy.safety.clone())),
            backups: Arc::new(FileBackupManager::new(
                layout.backup_root.clone(),
                Arc::clone(&partitions),
                buffer,
            )),
            flash: Arc::new(FlashManager::new(
                Arc::clone(&partitions),
                policy.download.clone(),
                buffer,
            )),
            bootloader: Arc::new(ShellBootloader::new(Arc::clone(&shell))),
            retention: Arc::new(ArtifactRetention::new(Arc::clone(&shell), layout)),
            verifier: Arc::new(Verifier::new(Arc::clone(&partitions), buffer)),
        };
        let lock = match &layout.lock_path {
            Some(path) => RunLock::with_file(path.clone()),
            None => RunLock::new(),
        };
        let pipeline = Arc::new(OperationPipeline::new(parts, policy, lock));
        let worker = OperationWorker::spawn(Arc::clone(&pipeline))?;
        info!(
            backup_root = %layout.backup_root.display(),
            shell = shell.name(),
            "romtools initialized"
        );
        Ok(Self {
            config,
            pipeline,
            worker,
        })
    }

    /// Real device: `su` (or direct when already root) and the block devices
    /// under the configured partition directory.
    pub fn for_device(config: Config) -> Result<Self> {
        let shell: Arc<dyn PrivilegedShell> = Arc::new(SuShell::detect());
        let partitions: Arc<dyn PartitionStore> = Arc::new(BlockDevicePartitions::new(
            config.layout.partition_dir.clone(),
        ));
        Self::new(config, shell, partitions)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<OperationPipeline> {
        &self.pipeline
    }

    fn parts(&self) -> &PipelineParts {
        self.pipeline.parts()
    }

    pub fn probe_capabilities(&self) -> Result<DeviceCapabilities> {
        Ok(self.parts().probe.probe()?)
    }

    /// Evaluate the gate against live state without running anything.
    pub fn check_safety(&self, request: &OperationRequest) -> Result<SafetyCheckResult> {
        let parts = self.parts();
        let capabilities = parts.probe.probe()?;
        let status = parts.status.refresh()?;
        let affected = self.pipeline.affected_partitions(request);
        let backup_exists =
            !affected.is_empty() && parts.backups.find_covering(&affected)?.is_some();
        Ok(parts.gate.evaluate(
            request.kind,
            &capabilities,
            &status,
            &GateContext {
                image_size: request.image.as_ref().map(|i| i.size_bytes),
                backup_exists,
            },
        ))
    }

    /// Queue a run on the background worker.
    pub fn request_operation(
        &self,
        request: OperationRequest,
        ack: WarningAcknowledgement,
        sink: Arc<dyn ProgressSink>,
    ) -> std::result::Result<OperationHandle, PipelineError> {
        self.worker.submit(request, ack, sink)
    }

    /// Run on the calling thread.
    pub fn run_operation(
        &self,
        request: &OperationRequest,
        ack: WarningAcknowledgement,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunReport, PipelineError> {
        self.pipeline.run(request, ack, sink, cancel)
    }

    /// Back up `partitions`, or the configured bootloader partitions when
    /// none are given.
    pub fn create_backup(&self, name: &BackupName, partitions: &[String]) -> Result<BackupInfo> {
        let _guard = self.pipeline.lock().try_acquire().map_err(PipelineError::from)?;
        let partitions = if partitions.is_empty() {
            self.config.policy.backup.bootloader_partitions.clone()
        } else {
            partitions.to_vec()
        };
        let device = self.parts().probe.probe()?;
        Ok(self
            .parts()
            .backups
            .create_backup(name, &partitions, &device)?)
    }

    pub fn restore_backup(&self, info: &BackupInfo) -> Result<ValidationResult> {
        let _guard = self.pipeline.lock().try_acquire().map_err(PipelineError::from)?;
        Ok(self.parts().backups.restore(info)?)
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        Ok(self.parts().backups.list_backups()?)
    }

    pub fn find_backup(&self, name: &BackupName) -> Result<BackupInfo> {
        Ok(self.parts().backups.find(name)?)
    }

    pub fn setup_retention(&self) -> Result<RetentionStatus> {
        let _guard = self.pipeline.lock().try_acquire().map_err(PipelineError::from)?;
        Ok(self.parts().retention.setup_retention()?)
    }

    pub fn restore_after_flash(&self) -> Result<RestoreReport> {
        let _guard = self.pipeline.lock().try_acquire().map_err(PipelineError::from)?;
        Ok(self.parts().retention.restore_after_flash()?)
    }

    /// Fetch `source` to `dest`, resuming a previous partial download.
    /// Relative destinations land in the configured download directory.
    pub fn download(
        &self,
        source: &dyn ImageSource,
        dest: &Path,
        expected_sha256: Option<&str>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport> {
        let dest = if dest.is_absolute() {
            dest.to_path_buf()
        } else {
            self.config.layout.download_dir.join(dest)
        };
        Ok(self
            .parts()
            .flash
            .download(source, &dest, expected_sha256, sink, cancel)?)
    }
}
