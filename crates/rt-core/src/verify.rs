//! Post-operation verification.

use crate::partition::{hash_reader, PartitionStore};
use rt_common::{BootloaderSafetyStatus, OperationKind, ValidationResult, CRITICAL_MARKER};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Verifier {
    partitions: Arc<dyn PartitionStore>,
    buffer_bytes: usize,
}

impl Verifier {
    pub fn new(partitions: Arc<dyn PartitionStore>, buffer_bytes: usize) -> Self {
        Self {
            partitions,
            buffer_bytes,
        }
    }

    /// Read back the first `size_bytes` of `partition` and compare with the
    /// digest of the image that was written.
    pub fn readback(&self, partition: &str, size_bytes: u64, expected_sha256: &str) -> ValidationResult {
        let result = self
            .partitions
            .open_read(partition)
            .and_then(|r| hash_reader(r, Some(size_bytes), self.buffer_bytes));
        let issue = match result {
            Ok((read, sha)) if read == size_bytes && sha == expected_sha256 => {
                debug!(partition, "readback verified");
                return ValidationResult::ok();
            }
            Ok((read, sha)) => {
                warn!(partition, read, expected_size = size_bytes, %sha, "readback mismatch");
                format!(
                    "{} {} does not match the written image. System may not be bootable. Recovery action required!",
                    CRITICAL_MARKER, partition
                )
            }
            Err(e) => format!(
                "{} could not read back {}: {}. Recovery action required!",
                CRITICAL_MARKER, partition, e
            ),
        };
        ValidationResult::from_issues(vec![issue])
    }

    /// Compare the refreshed lock state with what `operation` should have
    /// produced. A mismatch is reported but does not require recovery.
    pub fn lock_state(operation: OperationKind, status: &BootloaderSafetyStatus) -> ValidationResult {
        let issue = match operation {
            OperationKind::Unlock if !status.is_bootloader_unlocked => Some(
                "Bootloader unlock operation completed but device still reports locked state",
            ),
            OperationKind::Lock if status.is_bootloader_unlocked => Some(
                "Bootloader lock operation completed but device still reports unlocked state",
            ),
            _ => None,
        };
        match issue {
            Some(issue) => ValidationResult::from_issues(vec![issue.to_string()]),
            None => ValidationResult::ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryPartitions;

    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_readback_ignores_trailing_partition_bytes() {
        let parts = Arc::new(MemoryPartitions::new());
        parts.insert("boot", b"abc-and-padding".to_vec());
        let verifier = Verifier::new(parts, 4096);
        assert!(verifier.readback("boot", 3, ABC).success);
    }

    #[test]
    fn test_readback_mismatch_requires_recovery() {
        let parts = Arc::new(MemoryPartitions::new());
        parts.insert("boot", b"abd".to_vec());
        let result = Verifier::new(parts, 4096).readback("boot", 3, ABC);
        assert!(!result.success);
        assert!(result.requires_recovery);
    }

    #[test]
    fn test_readback_short_partition() {
        let parts = Arc::new(MemoryPartitions::new());
        parts.insert("boot", b"ab".to_vec());
        let result = Verifier::new(parts, 4096).readback("boot", 3, ABC);
        assert!(result.requires_recovery);
    }

    #[test]
    fn test_lock_state() {
        let mut status = BootloaderSafetyStatus::default();
        let unlock = Verifier::lock_state(OperationKind::Unlock, &status);
        assert!(!unlock.success && !unlock.requires_recovery);
        assert!(Verifier::lock_state(OperationKind::Lock, &status).success);
        status.is_bootloader_unlocked = true;
        assert!(Verifier::lock_state(OperationKind::Unlock, &status).success);
        assert!(!Verifier::lock_state(OperationKind::Lock, &status).success);
        assert!(Verifier::lock_state(OperationKind::Check, &status).success);
    }
}
