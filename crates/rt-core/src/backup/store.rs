//! Directory-backed backup store.

use super::manifest::{BackupManifest, PartitionEntry, MANIFEST_FILE_NAME};
use super::{BackupError, BackupManager};
use crate::logging::event_names;
use crate::partition::{copy_hashed, hash_reader, validate_partition_name, PartitionStore};
use rt_common::{BackupInfo, BackupName, DeviceCapabilities, ValidationResult, CRITICAL_MARKER};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct FileBackupManager {
    root: PathBuf,
    partitions: Arc<dyn PartitionStore>,
    buffer_bytes: usize,
}

impl FileBackupManager {
    pub fn new(
        root: impl Into<PathBuf>,
        partitions: Arc<dyn PartitionStore>,
        buffer_bytes: usize,
    ) -> Self {
        Self {
            root: root.into(),
            partitions,
            buffer_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staging_dir(&self, name: &BackupName) -> PathBuf {
        // Backup names never start with '.', so staging dirs cannot collide.
        self.root.join(format!(".staging-{}", name))
    }

    fn capture(
        &self,
        staging: &Path,
        partitions: &[String],
    ) -> Result<Vec<PartitionEntry>, BackupError> {
        let mut entries = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let reader = self.partitions.open_read(partition).map_err(|source| {
                BackupError::PartitionUnavailable {
                    partition: partition.clone(),
                    source,
                }
            })?;
            let file_name = PartitionEntry::image_file_name(partition);
            let file = File::create(staging.join(&file_name))?;
            let mut writer = BufWriter::new(&file);
            let (size_bytes, sha256) =
                copy_hashed(reader, &mut writer, self.buffer_bytes, &mut |_| {})?;
            writer.flush()?;
            drop(writer);
            file.sync_all()?;
            debug!(partition = %partition, size_bytes, "partition captured");
            entries.push(PartitionEntry {
                name: partition.clone(),
                file: file_name,
                size_bytes,
                sha256,
            });
        }
        Ok(entries)
    }

    /// Re-hash every image and compare with the manifest.
    fn verify_images(&self, dir: &Path, manifest: &BackupManifest) -> Result<(), BackupError> {
        for entry in &manifest.partitions {
            let path = dir.join(&entry.file);
            let file = File::open(&path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => BackupError::ManifestInvalid {
                    path: path.clone(),
                    reason: "image file is missing".to_string(),
                },
                _ => BackupError::Io(e),
            })?;
            let (size, sha256) = hash_reader(BufReader::new(file), None, self.buffer_bytes)?;
            if size != entry.size_bytes || sha256 != entry.sha256 {
                return Err(BackupError::ChecksumMismatch {
                    subject: format!("{}/{}", manifest.name, entry.file),
                    expected: format!("{} ({} bytes)", entry.sha256, entry.size_bytes),
                    actual: format!("{} ({} bytes)", sha256, size),
                });
            }
        }
        Ok(())
    }

    fn write_partition(&self, dir: &Path, entry: &PartitionEntry) -> io::Result<()> {
        let file = File::open(dir.join(&entry.file))?;
        let mut writer = self.partitions.open_write(&entry.name)?;
        copy_hashed(BufReader::new(file), &mut writer, self.buffer_bytes, &mut |_| {})?;
        writer.flush()
    }

    fn readback_matches(&self, entry: &PartitionEntry) -> io::Result<bool> {
        let reader = self.partitions.open_read(&entry.name)?;
        let (size, sha256) = hash_reader(reader, Some(entry.size_bytes), self.buffer_bytes)?;
        Ok(size == entry.size_bytes && sha256 == entry.sha256)
    }
}

impl BackupManager for FileBackupManager {
    fn create_backup(
        &self,
        name: &BackupName,
        partitions: &[String],
        device: &DeviceCapabilities,
    ) -> Result<BackupInfo, BackupError> {
        if partitions.is_empty() {
            return Err(BackupError::InvalidRequest(
                "at least one partition is required".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for partition in partitions {
            validate_partition_name(partition)
                .map_err(|e| BackupError::InvalidRequest(e.to_string()))?;
            if !seen.insert(partition.as_str()) {
                return Err(BackupError::InvalidRequest(format!(
                    "partition {} listed twice",
                    partition
                )));
            }
        }

        let target = self.root.join(name.as_str());
        if target.exists() {
            return Err(BackupError::AlreadyExists {
                name: name.to_string(),
            });
        }

        fs::create_dir_all(&self.root)?;
        let staging = self.staging_dir(name);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir(&staging)?;

        info!(backup = %name, partitions = ?partitions, "creating backup");
        let result = self.capture(&staging, partitions).and_then(|entries| {
            let manifest = BackupManifest::new(
                name,
                device.device_model.clone(),
                device.os_version.clone(),
                entries,
            );
            let file = File::create(staging.join(MANIFEST_FILE_NAME))?;
            serde_json::to_writer_pretty(&file, &manifest)?;
            file.sync_all()?;
            Ok(manifest)
        });

        let manifest = match result {
            Ok(manifest) => manifest,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&staging, &target) {
            let _ = fs::remove_dir_all(&staging);
            return Err(if target.exists() {
                BackupError::AlreadyExists {
                    name: name.to_string(),
                }
            } else {
                e.into()
            });
        }

        let info = manifest.to_info(target)?;
        info!(
            backup = %name,
            size_bytes = info.size_bytes,
            aggregate = %manifest.aggregate_sha256,
            "backup created"
        );
        Ok(info)
    }

    fn restore(&self, info: &BackupInfo) -> Result<ValidationResult, BackupError> {
        let dir = &info.storage_path;
        if !dir.is_dir() {
            return Err(BackupError::NotFound {
                name: info.name.to_string(),
            });
        }
        let manifest = BackupManifest::read_from(dir)?;
        if manifest.name != info.name.as_str() || manifest.partition_names() != info.partitions {
            return Err(BackupError::ManifestInvalid {
                path: dir.join(MANIFEST_FILE_NAME),
                reason: "manifest does not describe this backup".to_string(),
            });
        }
        self.verify_images(dir, &manifest)?;
        for entry in &manifest.partitions {
            if !self.partitions.exists(&entry.name) {
                return Err(BackupError::PartitionUnavailable {
                    partition: entry.name.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "no such partition"),
                });
            }
        }

        info!(backup = %info.name, partitions = manifest.partitions.len(), "restoring backup");
        let mut issues = Vec::new();
        for entry in &manifest.partitions {
            if let Err(e) = self.write_partition(dir, entry) {
                warn!(partition = %entry.name, error = %e, "restore write failed");
                issues.push(format!(
                    "{} restore of {} failed: {}",
                    CRITICAL_MARKER, entry.name, e
                ));
                continue;
            }
            match self.readback_matches(entry) {
                Ok(true) => debug!(partition = %entry.name, "restore verified"),
                Ok(false) => issues.push(format!(
                    "{} {} does not match the backup after restore",
                    CRITICAL_MARKER, entry.name
                )),
                Err(e) => issues.push(format!(
                    "{} could not read back {}: {}",
                    CRITICAL_MARKER, entry.name, e
                )),
            }
        }
        info!(
            target: event_names::BACKUP_RESTORED,
            backup = %info.name,
            issues = issues.len(),
            "backup restored"
        );
        Ok(ValidationResult::from_issues(issues))
    }

    fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !path.is_dir() {
                continue;
            }
            match BackupManifest::read_from(&path).and_then(|m| m.to_info(path.clone())) {
                Ok(info) => backups.push(info),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable backup"),
            }
        }
        backups.sort_by(|a, b| {
            a.created_at_epoch_ms
                .cmp(&b.created_at_epoch_ms)
                .then_with(|| a.name.as_str().cmp(b.name.as_str()))
        });
        Ok(backups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryPartitions;

    fn device() -> DeviceCapabilities {
        DeviceCapabilities {
            device_model: "Pixel 7".into(),
            os_version: "14".into(),
            ..Default::default()
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<MemoryPartitions>, FileBackupManager) {
        let temp = tempfile::tempdir().unwrap();
        let parts = Arc::new(MemoryPartitions::new());
        parts.insert("boot", b"boot image v1".to_vec());
        parts.insert("vbmeta", vec![7u8; 9000]);
        let manager = FileBackupManager::new(temp.path().join("backups"), parts.clone(), 4096);
        (temp, parts, manager)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_writes_images_and_manifest() {
        let (_temp, _parts, manager) = setup();
        let name = BackupName::new("pre-flash").unwrap();
        let info = manager
            .create_backup(&name, &names(&["boot", "vbmeta"]), &device())
            .unwrap();
        assert_eq!(info.size_bytes, 13 + 9000);
        assert_eq!(info.partitions, names(&["boot", "vbmeta"]));
        assert_eq!(info.device_model, "Pixel 7");
        assert_eq!(fs::read(info.storage_path.join("boot.img")).unwrap(), b"boot image v1");
        let manifest = BackupManifest::read_from(&info.storage_path).unwrap();
        assert_eq!(manifest.partitions.len(), 2);
        assert!(!manager.root().join(".staging-pre-flash").exists());
    }

    #[test]
    fn test_existing_name_is_rejected() {
        let (_temp, _parts, manager) = setup();
        let name = BackupName::new("dup").unwrap();
        manager.create_backup(&name, &names(&["boot"]), &device()).unwrap();
        let err = manager
            .create_backup(&name, &names(&["vbmeta"]), &device())
            .unwrap_err();
        assert!(matches!(err, BackupError::AlreadyExists { .. }));
        let listed = manager.list_backups().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].partitions, names(&["boot"]));
    }

    #[test]
    fn test_missing_partition_leaves_nothing_behind() {
        let (_temp, _parts, manager) = setup();
        let name = BackupName::new("partial").unwrap();
        let err = manager
            .create_backup(&name, &names(&["boot", "nope"]), &device())
            .unwrap_err();
        assert!(matches!(err, BackupError::PartitionUnavailable { .. }));
        assert!(manager.list_backups().unwrap().is_empty());
        assert!(!manager.root().join("partial").exists());
        assert!(!manager.root().join(".staging-partial").exists());
    }

    #[test]
    fn test_restore_round_trip() {
        let (_temp, parts, manager) = setup();
        let name = BackupName::new("good").unwrap();
        let info = manager.create_backup(&name, &names(&["boot"]), &device()).unwrap();
        parts.insert("boot", b"something else entirely".to_vec());

        let result = manager.restore(&info).unwrap();
        assert!(result.success, "{:?}", result.issues);
        assert_eq!(parts.get("boot").unwrap(), b"boot image v1");
    }

    #[test]
    fn test_tampered_image_writes_nothing() {
        let (_temp, parts, manager) = setup();
        let name = BackupName::new("tampered").unwrap();
        let info = manager
            .create_backup(&name, &names(&["boot", "vbmeta"]), &device())
            .unwrap();
        fs::write(info.storage_path.join("vbmeta.img"), b"evil").unwrap();
        parts.insert("boot", b"current".to_vec());
        let writes_before = parts.write_count();

        let err = manager.restore(&info).unwrap_err();
        assert!(matches!(err, BackupError::ChecksumMismatch { .. }));
        assert_eq!(parts.write_count(), writes_before);
        assert_eq!(parts.get("boot").unwrap(), b"current");
    }

    #[test]
    fn test_find_covering_prefers_newest() {
        let (_temp, _parts, manager) = setup();
        manager
            .create_backup(&BackupName::new("a").unwrap(), &names(&["boot"]), &device())
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        manager
            .create_backup(&BackupName::new("b").unwrap(), &names(&["boot", "vbmeta"]), &device())
            .unwrap();

        let boot = manager.find_covering(&names(&["boot"])).unwrap().unwrap();
        assert_eq!(boot.name.as_str(), "b");
        let both = manager.find_covering(&names(&["vbmeta", "boot"])).unwrap().unwrap();
        assert_eq!(both.name.as_str(), "b");
        assert!(manager.find_covering(&names(&["recovery"])).unwrap().is_none());
    }

    #[test]
    fn test_list_on_missing_root_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let manager = FileBackupManager::new(
            temp.path().join("none"),
            Arc::new(MemoryPartitions::new()),
            4096,
        );
        assert!(manager.list_backups().unwrap().is_empty());
    }
}
