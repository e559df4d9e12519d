//! Device state as observed by a probe or a status refresh.
//!
//! Both records are produced fresh for every pipeline run and discarded
//! afterwards; nothing here is cached across operations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What the device currently allows us to do.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub has_root_access: bool,
    pub has_bootloader_access: bool,
    pub has_recovery_access: bool,
    pub has_system_write_access: bool,
    /// ABIs reported by `ro.product.cpu.abilist`, deduplicated.
    pub supported_architectures: BTreeSet<String>,
    pub device_model: String,
    pub os_version: String,
    pub security_patch_level: String,
}

impl DeviceCapabilities {
    /// Whether the named capability flag is set.
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Root => self.has_root_access,
            Capability::Bootloader => self.has_bootloader_access,
            Capability::Recovery => self.has_recovery_access,
            Capability::SystemWrite => self.has_system_write_access,
        }
    }
}

/// A single capability flag, as required by an operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Root,
    Bootloader,
    Recovery,
    SystemWrite,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Root => write!(f, "root access"),
            Capability::Bootloader => write!(f, "bootloader access"),
            Capability::Recovery => write!(f, "recovery access"),
            Capability::SystemWrite => write!(f, "system write access"),
        }
    }
}

/// Cryptographic integrity classification of the boot chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifiedBootState {
    /// green: stock, verified boot.
    Verified,
    /// yellow: self-signed boot image.
    SelfSigned,
    /// orange: bootloader unlocked.
    Unlocked,
    /// red: boot verification failed.
    Corrupted,
    #[default]
    Unknown,
}

impl VerifiedBootState {
    /// Map the value of `ro.boot.verifiedbootstate`.
    pub fn from_prop(value: &str) -> Self {
        match value.trim() {
            "green" => VerifiedBootState::Verified,
            "yellow" => VerifiedBootState::SelfSigned,
            "orange" => VerifiedBootState::Unlocked,
            "red" => VerifiedBootState::Corrupted,
            _ => VerifiedBootState::Unknown,
        }
    }
}

/// Kernel mandatory access control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelinuxMode {
    Enforcing,
    Permissive,
    #[default]
    Unknown,
}

impl SelinuxMode {
    /// Parse `getenforce` output (case-insensitive).
    pub fn from_getenforce(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "enforcing" => SelinuxMode::Enforcing,
            "permissive" => SelinuxMode::Permissive,
            _ => SelinuxMode::Unknown,
        }
    }
}

/// Live device state consulted by the safety gate.
///
/// A status is only valid for gating while
/// `now - last_checked_at_epoch_ms <= max_status_age_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BootloaderSafetyStatus {
    pub is_bootloader_unlocked: bool,
    pub oem_unlock_enabled: bool,
    pub battery_level_percent: u8,
    pub available_storage_bytes: u64,
    pub verified_boot_state: VerifiedBootState,
    pub selinux_mode: SelinuxMode,
    pub device_compatible: bool,
    pub last_checked_at_epoch_ms: i64,
}

impl BootloaderSafetyStatus {
    /// Age of this status relative to `now_epoch_ms`. Clock skew into the
    /// future counts as zero age.
    pub fn age_ms(&self, now_epoch_ms: i64) -> u64 {
        now_epoch_ms
            .saturating_sub(self.last_checked_at_epoch_ms)
            .max(0) as u64
    }

    pub fn is_stale(&self, now_epoch_ms: i64, max_age_ms: u64) -> bool {
        self.last_checked_at_epoch_ms <= 0 || self.age_ms(now_epoch_ms) > max_age_ms
    }
}
