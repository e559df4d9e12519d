//! Live safety status.

use super::ProbeError;
use crate::shell::{getprop, CommandSpec, PrivilegedShell};
use rt_common::{BootloaderSafetyStatus, SelinuxMode, VerifiedBootState};
use rt_config::SafetyPolicy;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Re-reads the device state the safety gate depends on.
pub trait StatusProvider: Send + Sync {
    fn refresh(&self) -> Result<BootloaderSafetyStatus, ProbeError>;
}

pub struct ShellStatusProvider {
    shell: Arc<dyn PrivilegedShell>,
    policy: SafetyPolicy,
    /// Free space is measured on the filesystem holding this path.
    storage_path: PathBuf,
}

impl ShellStatusProvider {
    pub fn new(
        shell: Arc<dyn PrivilegedShell>,
        policy: SafetyPolicy,
        storage_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shell,
            policy,
            storage_path: storage_path.into(),
        }
    }

    fn oem_unlock_enabled(&self) -> Result<bool, ProbeError> {
        for key in ["oem_unlock_allowed", "oem_unlock_enabled"] {
            let output = self
                .shell
                .run(&CommandSpec::new("settings", ["get", "global", key]))?;
            if !output.success() {
                continue;
            }
            match output.first_line() {
                "1" => return Ok(true),
                "0" => return Ok(false),
                _ => continue,
            }
        }
        Ok(false)
    }

    fn battery_level(&self) -> Result<u8, ProbeError> {
        let output = self.shell.run(&CommandSpec::new("dumpsys", ["battery"]))?;
        parse_battery_level(&output.stdout).ok_or_else(|| ProbeError::PropertyParse {
            property: "dumpsys battery level".to_string(),
            value: output.stdout.trim().chars().take(120).collect(),
        })
    }

    fn available_storage(&self) -> Result<u64, ProbeError> {
        let target = nearest_existing(&self.storage_path);
        let output = self.shell.run(&CommandSpec::new(
            "stat",
            [
                "-f".to_string(),
                "-c".to_string(),
                "%a %S".to_string(),
                target.to_string_lossy().into_owned(),
            ],
        ))?;
        parse_statfs(output.first_line()).ok_or_else(|| ProbeError::PropertyParse {
            property: format!("free space of {}", target.display()),
            value: output.first_line().to_string(),
        })
    }
}

impl StatusProvider for ShellStatusProvider {
    fn refresh(&self) -> Result<BootloaderSafetyStatus, ProbeError> {
        let shell = self.shell.as_ref();
        let flash_locked = getprop(shell, "ro.boot.flash.locked")?;
        let verified_boot_state =
            VerifiedBootState::from_prop(&getprop(shell, "ro.boot.verifiedbootstate")?);
        let selinux = shell.run(&CommandSpec::new("getenforce", Vec::<String>::new()))?;
        let selinux_mode = if selinux.success() {
            SelinuxMode::from_getenforce(selinux.first_line())
        } else {
            SelinuxMode::Unknown
        };
        let manufacturer = getprop(shell, "ro.product.manufacturer")?;

        Ok(BootloaderSafetyStatus {
            is_bootloader_unlocked: flash_locked == "0"
                || verified_boot_state == VerifiedBootState::Unlocked,
            oem_unlock_enabled: self.oem_unlock_enabled()?,
            battery_level_percent: self.battery_level()?,
            available_storage_bytes: self.available_storage()?,
            verified_boot_state,
            selinux_mode,
            device_compatible: self.policy.is_compatible_manufacturer(&manufacturer),
            last_checked_at_epoch_ms: chrono::Utc::now().timestamp_millis(),
        })
    }
}

/// `level: N` from `dumpsys battery`.
fn parse_battery_level(dumpsys: &str) -> Option<u8> {
    dumpsys.lines().find_map(|line| {
        let value = line.trim().strip_prefix("level:")?;
        let level: u32 = value.trim().parse().ok()?;
        Some(level.min(100) as u8)
    })
}

/// `<available blocks> <block size>` from `stat -f -c '%a %S'`.
fn parse_statfs(line: &str) -> Option<u64> {
    let mut parts = line.split_whitespace();
    let blocks: u64 = parts.next()?.parse().ok()?;
    let block_size: u64 = parts.next()?.parse().ok()?;
    blocks.checked_mul(block_size)
}

fn nearest_existing(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .unwrap_or(Path::new("/"))
        .to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeDevice;

    #[test]
    fn test_parse_battery_level() {
        let dumpsys = "Current Battery Service state:\n  AC powered: false\n  level: 87\n  scale: 100\n";
        assert_eq!(parse_battery_level(dumpsys), Some(87));
        assert_eq!(parse_battery_level("  level: 250"), Some(100));
        assert_eq!(parse_battery_level("nothing"), None);
    }

    #[test]
    fn test_parse_statfs() {
        assert_eq!(parse_statfs("1000 4096"), Some(4_096_000));
        assert_eq!(parse_statfs("x 4096"), None);
        assert_eq!(parse_statfs(""), None);
    }

    #[test]
    fn test_nearest_existing() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("a/b/c");
        assert_eq!(nearest_existing(&missing), temp.path());
    }

    #[test]
    fn test_refresh_reads_status() {
        let device = FakeDevice::new();
        device.set_battery(64);
        device.set_free_bytes(10_000);
        let provider = ShellStatusProvider::new(
            device.shell(),
            SafetyPolicy::default(),
            device.root().join("backups"),
        );
        let status = provider.refresh().expect("refresh");
        assert_eq!(status.battery_level_percent, 64);
        assert_eq!(status.available_storage_bytes, 10_000);
        assert!(!status.is_bootloader_unlocked);
        assert!(status.oem_unlock_enabled);
        assert!(status.device_compatible);
        assert_eq!(status.verified_boot_state, VerifiedBootState::Verified);
        assert_eq!(status.selinux_mode, SelinuxMode::Enforcing);
        assert!(status.last_checked_at_epoch_ms > 0);
    }

    #[test]
    fn test_oem_unlock_falls_back() {
        let device = FakeDevice::new();
        device.set_setting("oem_unlock_allowed", None);
        device.set_setting("oem_unlock_enabled", Some("0"));
        let provider =
            ShellStatusProvider::new(device.shell(), SafetyPolicy::default(), device.root());
        assert!(!provider.refresh().unwrap().oem_unlock_enabled);
    }

    #[test]
    fn test_unknown_manufacturer_is_incompatible() {
        let device = FakeDevice::new();
        device.set_prop("ro.product.manufacturer", "Acme");
        let provider =
            ShellStatusProvider::new(device.shell(), SafetyPolicy::default(), device.root());
        assert!(!provider.refresh().unwrap().device_compatible);
    }
}
