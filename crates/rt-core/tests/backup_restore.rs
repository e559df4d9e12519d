//! Backup capture, listing and integrity-checked restore over a fake device.

use rt_common::{BackupName, DeviceCapabilities, Error};
use rt_config::Policy;
use rt_core::backup::{
    BackupError, BackupManager, BackupManifest, FileBackupManager, MANIFEST_FILE_NAME,
};
use rt_core::probe::CapabilityProbe;
use rt_core::test_utils::FakeDevice;
use std::fs;

fn manager(device: &FakeDevice) -> FileBackupManager {
    FileBackupManager::new(device.layout().backup_root, device.partitions(), 4096)
}

fn capabilities(device: &FakeDevice) -> DeviceCapabilities {
    let pipeline = device.pipeline(&Policy::default());
    pipeline.parts().probe.probe().unwrap()
}

fn partitions(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_backup_then_restore_round_trip() {
    let device = FakeDevice::new();
    let backups = manager(&device);
    let name = BackupName::new("before-rom").unwrap();
    let boot = device.partitions().get("boot").unwrap();
    let vbmeta = device.partitions().get("vbmeta").unwrap();

    let info = backups
        .create_backup(&name, &partitions(&["boot", "vbmeta"]), &capabilities(&device))
        .unwrap();
    assert_eq!(info.device_model, "Pixel 7");
    assert_eq!(info.size_bytes, (boot.len() + vbmeta.len()) as u64);
    assert!(info.storage_path.join(MANIFEST_FILE_NAME).is_file());

    device.partitions().insert("boot", b"flashed".to_vec());
    device.partitions().insert("vbmeta", b"patched".to_vec());
    let result = backups.restore(&info).unwrap();

    assert!(result.success, "{:?}", result.issues);
    assert_eq!(device.partitions().get("boot").unwrap(), boot);
    assert_eq!(device.partitions().get("vbmeta").unwrap(), vbmeta);
}

#[test]
fn test_tampered_manifest_checksum_refuses_restore() {
    let device = FakeDevice::new();
    let backups = manager(&device);
    let info = backups
        .create_backup(
            &BackupName::new("tamper").unwrap(),
            &partitions(&["boot"]),
            &capabilities(&device),
        )
        .unwrap();

    let manifest_path = info.storage_path.join(MANIFEST_FILE_NAME);
    let mut manifest: BackupManifest =
        serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
    manifest.partitions[0].sha256 = "f".repeat(64);
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();

    device.partitions().insert("boot", b"current".to_vec());
    let writes_before = device.partitions().write_count();

    let err = backups.restore(&info).unwrap_err();
    assert!(matches!(err, BackupError::ChecksumMismatch { .. }), "{err}");
    assert_eq!(device.partitions().write_count(), writes_before);
    assert_eq!(device.partitions().get("boot").unwrap(), b"current");

    let unified = Error::from(err);
    assert_eq!(unified.code(), 45);
}

#[test]
fn test_tampered_image_refuses_restore() {
    let device = FakeDevice::new();
    let backups = manager(&device);
    let info = backups
        .create_backup(
            &BackupName::new("bitrot").unwrap(),
            &partitions(&["boot", "vbmeta"]),
            &capabilities(&device),
        )
        .unwrap();

    let image = info.storage_path.join("vbmeta.img");
    let mut bytes = fs::read(&image).unwrap();
    bytes[0] ^= 0x01;
    fs::write(&image, bytes).unwrap();

    let err = backups.restore(&info).unwrap_err();
    assert!(matches!(err, BackupError::ChecksumMismatch { .. }));
    assert_eq!(device.partitions().write_count(), 0);
}

#[test]
fn test_backups_are_append_only() {
    let device = FakeDevice::new();
    let backups = manager(&device);
    let name = BackupName::new("once").unwrap();
    let caps = capabilities(&device);
    backups
        .create_backup(&name, &partitions(&["boot"]), &caps)
        .unwrap();

    let err = backups
        .create_backup(&name, &partitions(&["recovery"]), &caps)
        .unwrap_err();
    assert!(matches!(err, BackupError::AlreadyExists { .. }));

    let listed = backups.list_backups().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].partitions, partitions(&["boot"]));
}

#[test]
fn test_find_covering_prefers_newest() {
    let device = FakeDevice::new();
    let backups = manager(&device);
    let caps = capabilities(&device);
    backups
        .create_backup(&BackupName::new("a-boot").unwrap(), &partitions(&["boot"]), &caps)
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    backups
        .create_backup(
            &BackupName::new("b-full").unwrap(),
            &partitions(&["boot", "vbmeta", "recovery"]),
            &caps,
        )
        .unwrap();

    let covering = backups.find_covering(&partitions(&["boot"])).unwrap().unwrap();
    assert_eq!(covering.name.as_str(), "b-full");
    let vbmeta_only = backups
        .find_covering(&partitions(&["vbmeta"]))
        .unwrap()
        .unwrap();
    assert_eq!(vbmeta_only.name.as_str(), "b-full");
    assert!(backups
        .find_covering(&partitions(&["system"]))
        .unwrap()
        .is_none());
}

#[test]
fn test_facade_backup_defaults_to_bootloader_partitions() {
    let device = FakeDevice::new();
    let tools = device.romtools(&Policy::default());
    let info = tools
        .create_backup(&BackupName::new("manual").unwrap(), &[])
        .unwrap();
    assert_eq!(info.partitions, partitions(&["boot", "vbmeta"]));

    let found = tools.find_backup(&BackupName::new("manual").unwrap()).unwrap();
    assert_eq!(found, info);
    let missing = tools
        .find_backup(&BackupName::new("nope").unwrap())
        .unwrap_err();
    assert!(matches!(missing, Error::BackupNotFound { .. }));

    device.partitions().insert("boot", b"changed".to_vec());
    let result = tools.restore_backup(&info).unwrap();
    assert!(result.success);
    assert_ne!(device.partitions().get("boot").unwrap(), b"changed");
}
