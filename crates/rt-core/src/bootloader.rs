//! Bootloader state changes and temporary boots.
//!
//! These go through `fastboot` on the privileged shell. The device must
//! already be reachable by fastboot; rebooting into the bootloader is the
//! shell implementation's concern.

use crate::flash::ImageFile;
use crate::shell::{run_checked, CheckedError, CommandSpec, PrivilegedShell};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const FASTBOOT_TIMEOUT: Duration = Duration::from_secs(120);

pub trait BootloaderControl: Send + Sync {
    fn unlock(&self) -> Result<(), CheckedError>;

    fn lock(&self) -> Result<(), CheckedError>;

    /// Boot `image` once without writing it to any partition.
    fn boot_image(&self, image: &ImageFile) -> Result<(), CheckedError>;
}

pub struct ShellBootloader {
    shell: Arc<dyn PrivilegedShell>,
}

impl ShellBootloader {
    pub fn new(shell: Arc<dyn PrivilegedShell>) -> Self {
        Self { shell }
    }

    fn fastboot(&self, args: &[&str]) -> Result<(), CheckedError> {
        let spec =
            CommandSpec::new("fastboot", args.iter().copied()).with_timeout(FASTBOOT_TIMEOUT);
        info!(command = %spec.command_line(), "fastboot");
        run_checked(self.shell.as_ref(), &spec).map(|_| ())
    }
}

impl BootloaderControl for ShellBootloader {
    fn unlock(&self) -> Result<(), CheckedError> {
        self.fastboot(&["flashing", "unlock"])
    }

    fn lock(&self) -> Result<(), CheckedError> {
        self.fastboot(&["flashing", "lock"])
    }

    fn boot_image(&self, image: &ImageFile) -> Result<(), CheckedError> {
        let path = image.path.to_string_lossy();
        self.fastboot(&["boot", &path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedShell;
    use crate::shell::CommandOutput;

    #[test]
    fn test_commands() {
        let shell = Arc::new(ScriptedShell::new());
        shell.respond("fastboot", CommandOutput::ok("OKAY"));
        let bootloader = ShellBootloader::new(shell.clone());
        bootloader.unlock().unwrap();
        bootloader.lock().unwrap();
        assert_eq!(
            shell.calls(),
            vec![
                "fastboot flashing unlock".to_string(),
                "fastboot flashing lock".to_string()
            ]
        );
    }

    #[test]
    fn test_failure_surfaces_exit_code() {
        let shell = Arc::new(ScriptedShell::new());
        shell.respond("fastboot", CommandOutput::failed(1, "FAILED (remote: 'not allowed')"));
        let err = ShellBootloader::new(shell).unlock().unwrap_err();
        match err {
            CheckedError::Failed(failed) => {
                assert_eq!(failed.exit_code, 1);
                assert!(failed.stderr.contains("not allowed"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
