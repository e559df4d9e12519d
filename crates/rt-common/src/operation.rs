//! Operation kinds and their static requirements.

use crate::device::Capability;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// A device operation the pipeline can run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Read-only inspection.
    Check,
    /// Unlock the bootloader (wipes user data).
    Unlock,
    /// Re-lock the bootloader.
    Lock,
    /// Write an image to a named partition.
    FlashPartition,
    /// Install a custom recovery image.
    FlashRecovery,
    /// Boot an image once without writing it.
    BootImage,
}

/// Requirement flags attached to an [`OperationKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperationRequirements {
    pub requires_high_battery: bool,
    pub requires_storage: bool,
    pub is_destructive: bool,
    pub required_capabilities: &'static [Capability],
}

const CHECK: OperationRequirements = OperationRequirements {
    requires_high_battery: false,
    requires_storage: false,
    is_destructive: false,
    required_capabilities: &[],
};
const UNLOCK: OperationRequirements = OperationRequirements {
    requires_high_battery: true,
    requires_storage: false,
    is_destructive: true,
    required_capabilities: &[Capability::Bootloader],
};
const LOCK: OperationRequirements = OperationRequirements {
    requires_high_battery: true,
    requires_storage: false,
    is_destructive: true,
    required_capabilities: &[Capability::Bootloader],
};
const FLASH_PARTITION: OperationRequirements = OperationRequirements {
    requires_high_battery: true,
    requires_storage: true,
    is_destructive: true,
    required_capabilities: &[Capability::Root],
};
const FLASH_RECOVERY: OperationRequirements = OperationRequirements {
    requires_high_battery: true,
    requires_storage: true,
    is_destructive: false,
    required_capabilities: &[Capability::Root, Capability::Recovery],
};
const BOOT_IMAGE: OperationRequirements = OperationRequirements {
    requires_high_battery: false,
    requires_storage: false,
    is_destructive: false,
    required_capabilities: &[Capability::Bootloader],
};

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Check,
        OperationKind::Unlock,
        OperationKind::Lock,
        OperationKind::FlashPartition,
        OperationKind::FlashRecovery,
        OperationKind::BootImage,
    ];

    /// Static requirements for this kind. Every consumer reads the flags from
    /// here rather than matching on the kind.
    pub const fn requirements(self) -> &'static OperationRequirements {
        match self {
            OperationKind::Check => &CHECK,
            OperationKind::Unlock => &UNLOCK,
            OperationKind::Lock => &LOCK,
            OperationKind::FlashPartition => &FLASH_PARTITION,
            OperationKind::FlashRecovery => &FLASH_RECOVERY,
            OperationKind::BootImage => &BOOT_IMAGE,
        }
    }

    /// Whether this kind writes an image to a partition.
    pub fn writes_image(self) -> bool {
        matches!(
            self,
            OperationKind::FlashPartition | OperationKind::FlashRecovery
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Check => "check",
            OperationKind::Unlock => "unlock",
            OperationKind::Lock => "lock",
            OperationKind::FlashPartition => "flash_partition",
            OperationKind::FlashRecovery => "flash_recovery",
            OperationKind::BootImage => "boot_image",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirement_table() {
        let unlock = OperationKind::Unlock.requirements();
        assert!(unlock.requires_high_battery && unlock.is_destructive && !unlock.requires_storage);

        let recovery = OperationKind::FlashRecovery.requirements();
        assert!(recovery.requires_storage);
        assert!(!recovery.is_destructive);
        assert_eq!(
            recovery.required_capabilities,
            &[Capability::Root, Capability::Recovery]
        );

        let check = OperationKind::Check.requirements();
        assert!(check.required_capabilities.is_empty());
        assert!(!check.is_destructive);
    }

    #[test]
    fn test_only_flash_kinds_write_images() {
        let writers: Vec<_> = OperationKind::ALL
            .iter()
            .filter(|k| k.writes_image())
            .collect();
        assert_eq!(
            writers,
            vec![&OperationKind::FlashPartition, &OperationKind::FlashRecovery]
        );
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&OperationKind::FlashPartition).unwrap(),
            "\"flash_partition\""
        );
    }
}
