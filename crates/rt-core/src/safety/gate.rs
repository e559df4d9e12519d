use rt_common::{
    BootloaderSafetyStatus, DeviceCapabilities, OperationKind, SafetyCheckResult, SelinuxMode,
    VerifiedBootState,
};
use rt_config::SafetyPolicy;

const MIB: u64 = 1024 * 1024;

/// Per-request facts the gate cannot derive from device state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateContext {
    /// Size of the image to be written, when one is involved.
    pub image_size: Option<u64>,
    /// A backup covering the affected partitions exists.
    pub backup_exists: bool,
}

pub trait SafetyGate: Send + Sync {
    fn evaluate(
        &self,
        operation: OperationKind,
        capabilities: &DeviceCapabilities,
        status: &BootloaderSafetyStatus,
        context: &GateContext,
    ) -> SafetyCheckResult;
}

/// Gate driven by the thresholds in `policy.json`.
#[derive(Debug, Clone)]
pub struct PolicySafetyGate {
    policy: SafetyPolicy,
}

impl PolicySafetyGate {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }
}

impl SafetyGate for PolicySafetyGate {
    fn evaluate(
        &self,
        operation: OperationKind,
        capabilities: &DeviceCapabilities,
        status: &BootloaderSafetyStatus,
        context: &GateContext,
    ) -> SafetyCheckResult {
        let req = operation.requirements();
        let policy = &self.policy;
        let mut warnings = Vec::new();
        let mut critical = Vec::new();

        if !status.device_compatible {
            critical.push(format!(
                "Device model {} may not support this operation",
                display_model(&capabilities.device_model)
            ));
        }

        let battery = status.battery_level_percent;
        if req.requires_high_battery && battery < policy.min_battery_percent {
            critical.push(format!(
                "Battery level too low: {}% (minimum {}% required)",
                battery, policy.min_battery_percent
            ));
        } else if battery < policy.low_battery_warning_percent {
            warnings.push(format!(
                "Battery level is low: {}%. Consider charging before proceeding.",
                battery
            ));
        }

        if req.requires_storage {
            let required = policy.required_storage(context.image_size);
            if status.available_storage_bytes < required {
                critical.push(format!(
                    "Insufficient storage: {}MB available ({}MB required)",
                    status.available_storage_bytes / MIB,
                    required.div_ceil(MIB)
                ));
            }
        }

        if operation == OperationKind::Unlock && !status.oem_unlock_enabled {
            critical.push("OEM unlocking is not enabled in Developer Options".to_string());
        }

        match status.verified_boot_state {
            VerifiedBootState::Corrupted if req.is_destructive => critical.push(
                "Verified boot reports a corrupted boot chain. Repair the device before modifying it."
                    .to_string(),
            ),
            VerifiedBootState::Unknown => {
                warnings.push("Cannot determine verified boot state. Proceed with caution.".to_string())
            }
            _ => {}
        }

        match status.selinux_mode {
            SelinuxMode::Unknown if req.is_destructive => critical.push(
                "Cannot determine SELinux mode. Destructive operations are not allowed.".to_string(),
            ),
            SelinuxMode::Unknown => {
                warnings.push("Cannot determine SELinux mode. Proceed with caution.".to_string())
            }
            SelinuxMode::Enforcing if policy.warn_on_selinux_enforcing => warnings
                .push("SELinux is enforcing. Some operations may be restricted.".to_string()),
            _ => {}
        }

        if req.is_destructive && !context.backup_exists {
            warnings.push("No recent backup detected. This operation will WIPE ALL DATA!".to_string());
        }

        for capability in req.required_capabilities {
            if !capabilities.has(*capability) {
                critical.push(format!("Missing required capability: {}", capability));
            }
        }

        SafetyCheckResult::from_findings(warnings, critical)
    }
}

fn display_model(model: &str) -> &str {
    if model.is_empty() {
        "(unknown)"
    } else {
        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities {
            has_root_access: true,
            has_bootloader_access: true,
            has_recovery_access: true,
            has_system_write_access: true,
            supported_architectures: BTreeSet::from(["arm64-v8a".to_string()]),
            device_model: "Pixel 7".into(),
            os_version: "14".into(),
            security_patch_level: "2026-09-05".into(),
        }
    }

    fn healthy() -> BootloaderSafetyStatus {
        BootloaderSafetyStatus {
            is_bootloader_unlocked: false,
            oem_unlock_enabled: true,
            battery_level_percent: 90,
            available_storage_bytes: 8 * 1024 * MIB,
            verified_boot_state: VerifiedBootState::Verified,
            selinux_mode: SelinuxMode::Permissive,
            device_compatible: true,
            last_checked_at_epoch_ms: 1,
        }
    }

    fn with_backup() -> GateContext {
        GateContext {
            image_size: None,
            backup_exists: true,
        }
    }

    fn gate() -> PolicySafetyGate {
        PolicySafetyGate::new(SafetyPolicy::default())
    }

    #[test]
    fn test_healthy_device_is_clean() {
        for op in OperationKind::ALL {
            let result = gate().evaluate(op, &caps(), &healthy(), &with_backup());
            assert!(result.is_clean(), "{op}: {:?}", result);
        }
    }

    #[test]
    fn test_low_battery_blocks_high_battery_ops() {
        let mut status = healthy();
        status.battery_level_percent = 20;
        let result = gate().evaluate(OperationKind::Unlock, &caps(), &status, &with_backup());
        assert!(!result.passed);
        assert_eq!(
            result.critical_issues,
            vec!["Battery level too low: 20% (minimum 50% required)".to_string()]
        );
        assert!(result.warnings.is_empty());

        // Check does not need a high battery: warn instead.
        let result = gate().evaluate(OperationKind::Check, &caps(), &status, &with_backup());
        assert!(result.passed && result.can_proceed_with_warning);
        assert!(result.warnings[0].starts_with("Battery level is low: 20%"));
    }

    #[test]
    fn test_battery_between_thresholds_is_fine() {
        let mut status = healthy();
        status.battery_level_percent = 40;
        let result = gate().evaluate(OperationKind::Check, &caps(), &status, &with_backup());
        assert!(result.is_clean());
    }

    #[test]
    fn test_storage_margin() {
        let mut status = healthy();
        let image = 1000 * MIB;
        let ctx = GateContext {
            image_size: Some(image),
            backup_exists: true,
        };
        status.available_storage_bytes = image * 105 / 100;
        let blocked = gate().evaluate(OperationKind::FlashPartition, &caps(), &status, &ctx);
        assert!(!blocked.passed);
        assert!(blocked.critical_issues[0].starts_with("Insufficient storage"));

        status.available_storage_bytes = image * 120 / 100;
        let ok = gate().evaluate(OperationKind::FlashPartition, &caps(), &status, &ctx);
        assert!(ok.passed, "{:?}", ok);
    }

    #[test]
    fn test_storage_floor_without_image() {
        let mut status = healthy();
        status.available_storage_bytes = 100 * MIB;
        let result = gate().evaluate(OperationKind::FlashRecovery, &caps(), &status, &with_backup());
        assert!(!result.passed);
        let result = gate().evaluate(OperationKind::Unlock, &caps(), &status, &with_backup());
        assert!(result.passed, "unlock does not stage images");
    }

    #[test]
    fn test_unlock_needs_oem_unlock() {
        let mut status = healthy();
        status.oem_unlock_enabled = false;
        let unlock = gate().evaluate(OperationKind::Unlock, &caps(), &status, &with_backup());
        assert_eq!(
            unlock.critical_issues,
            vec!["OEM unlocking is not enabled in Developer Options".to_string()]
        );
        let lock = gate().evaluate(OperationKind::Lock, &caps(), &status, &with_backup());
        assert!(lock.passed);
    }

    #[test]
    fn test_corrupted_boot_blocks_destructive_only() {
        let mut status = healthy();
        status.verified_boot_state = VerifiedBootState::Corrupted;
        assert!(!gate().evaluate(OperationKind::Unlock, &caps(), &status, &with_backup()).passed);
        assert!(gate().evaluate(OperationKind::BootImage, &caps(), &status, &with_backup()).passed);
    }

    #[test]
    fn test_unknown_boot_state_warns() {
        let mut status = healthy();
        status.verified_boot_state = VerifiedBootState::Unknown;
        let result = gate().evaluate(OperationKind::Lock, &caps(), &status, &with_backup());
        assert!(result.passed && result.can_proceed_with_warning);
    }

    #[test]
    fn test_selinux_unknown_escalates_for_destructive() {
        let mut status = healthy();
        status.selinux_mode = SelinuxMode::Unknown;
        assert!(!gate().evaluate(OperationKind::FlashPartition, &caps(), &status, &with_backup()).passed);
        let check = gate().evaluate(OperationKind::Check, &caps(), &status, &with_backup());
        assert!(check.passed && check.warnings.len() == 1);
    }

    #[test]
    fn test_selinux_enforcing_warning_is_configurable() {
        let mut status = healthy();
        status.selinux_mode = SelinuxMode::Enforcing;
        assert_eq!(
            gate().evaluate(OperationKind::Check, &caps(), &status, &with_backup()).warnings.len(),
            1
        );
        let mut policy = SafetyPolicy::default();
        policy.warn_on_selinux_enforcing = false;
        let quiet = PolicySafetyGate::new(policy);
        assert!(quiet.evaluate(OperationKind::Check, &caps(), &status, &with_backup()).is_clean());
    }

    #[test]
    fn test_missing_backup_warns_for_destructive() {
        let ctx = GateContext::default();
        let unlock = gate().evaluate(OperationKind::Unlock, &caps(), &healthy(), &ctx);
        assert_eq!(
            unlock.warnings,
            vec!["No recent backup detected. This operation will WIPE ALL DATA!".to_string()]
        );
        let recovery = gate().evaluate(OperationKind::FlashRecovery, &caps(), &healthy(), &ctx);
        assert!(recovery.is_clean());
    }

    #[test]
    fn test_missing_capabilities_one_issue_each() {
        let mut c = caps();
        c.has_root_access = false;
        c.has_recovery_access = false;
        let result = gate().evaluate(OperationKind::FlashRecovery, &c, &healthy(), &with_backup());
        assert_eq!(
            result.critical_issues,
            vec![
                "Missing required capability: root access".to_string(),
                "Missing required capability: recovery access".to_string(),
            ]
        );
    }

    #[test]
    fn test_incompatible_device_names_model() {
        let mut status = healthy();
        status.device_compatible = false;
        let result = gate().evaluate(OperationKind::Check, &caps(), &status, &with_backup());
        assert_eq!(
            result.critical_issues,
            vec!["Device model Pixel 7 may not support this operation".to_string()]
        );
    }

    fn arb_status() -> impl Strategy<Value = BootloaderSafetyStatus> {
        (
            any::<bool>(),
            any::<bool>(),
            0u8..=100,
            0u64..(4 * 1024 * MIB),
            prop_oneof![
                Just(VerifiedBootState::Verified),
                Just(VerifiedBootState::SelfSigned),
                Just(VerifiedBootState::Unlocked),
                Just(VerifiedBootState::Corrupted),
                Just(VerifiedBootState::Unknown),
            ],
            prop_oneof![
                Just(SelinuxMode::Enforcing),
                Just(SelinuxMode::Permissive),
                Just(SelinuxMode::Unknown),
            ],
            any::<bool>(),
        )
            .prop_map(|(unlocked, oem, battery, storage, vb, se, compat)| {
                BootloaderSafetyStatus {
                    is_bootloader_unlocked: unlocked,
                    oem_unlock_enabled: oem,
                    battery_level_percent: battery,
                    available_storage_bytes: storage,
                    verified_boot_state: vb,
                    selinux_mode: se,
                    device_compatible: compat,
                    last_checked_at_epoch_ms: 1,
                }
            })
    }

    proptest! {
        #[test]
        fn prop_result_flags_are_consistent(
            status in arb_status(),
            op in proptest::sample::select(OperationKind::ALL.to_vec()),
            backup in any::<bool>(),
            image in proptest::option::of(0u64..(2 * 1024 * MIB)),
        ) {
            let ctx = GateContext { image_size: image, backup_exists: backup };
            let result = gate().evaluate(op, &caps(), &status, &ctx);
            prop_assert_eq!(result.passed, result.critical_issues.is_empty());
            prop_assert_eq!(
                result.can_proceed_with_warning,
                result.passed && !result.warnings.is_empty()
            );
            if op.requirements().is_destructive
                && status.verified_boot_state == VerifiedBootState::Corrupted
            {
                prop_assert!(!result.passed);
            }
            if op.requirements().requires_high_battery
                && status.battery_level_percent < 50
            {
                prop_assert!(!result.passed);
            }
        }

        #[test]
        fn prop_gate_is_deterministic(status in arb_status(), backup in any::<bool>()) {
            let ctx = GateContext { image_size: None, backup_exists: backup };
            let a = gate().evaluate(OperationKind::Unlock, &caps(), &status, &ctx);
            let b = gate().evaluate(OperationKind::Unlock, &caps(), &status, &ctx);
            prop_assert_eq!(a, b);
        }
    }
}
