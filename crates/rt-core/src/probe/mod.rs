//! Capability probing.
//!
//! A probe issues read-only commands through the privileged shell and builds a
//! fresh [`DeviceCapabilities`]. Nothing is cached and nothing is retried; the
//! pipeline probes once per run.

mod status;

pub use status::{ShellStatusProvider, StatusProvider};

use crate::shell::{getprop, CommandSpec, PrivilegedShell, ShellError};
use rt_common::DeviceCapabilities;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("root access is not available: {0}")]
    NoRoot(String),

    #[error("shell error during probe: {0}")]
    Shell(ShellError),

    #[error("could not parse {property}: {value:?}")]
    PropertyParse { property: String, value: String },
}

impl From<ShellError> for ProbeError {
    fn from(err: ShellError) -> Self {
        match err {
            ShellError::Unavailable(msg) => ProbeError::NoRoot(msg),
            other => ProbeError::Shell(other),
        }
    }
}

impl From<ProbeError> for rt_common::Error {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::NoRoot(msg) => rt_common::Error::NoRoot(msg),
            ProbeError::Shell(ShellError::Unavailable(msg)) => {
                rt_common::Error::ShellUnavailable(msg)
            }
            ProbeError::Shell(e) => rt_common::Error::Probe(e.to_string()),
            ProbeError::PropertyParse { property, value } => {
                rt_common::Error::PropertyParse { property, value }
            }
        }
    }
}

/// Produces a fresh capability snapshot. Side-effect free.
pub trait CapabilityProbe: Send + Sync {
    fn probe(&self) -> Result<DeviceCapabilities, ProbeError>;
}

pub struct ShellCapabilityProbe {
    shell: Arc<dyn PrivilegedShell>,
    partition_dir: PathBuf,
}

impl ShellCapabilityProbe {
    pub fn new(shell: Arc<dyn PrivilegedShell>, partition_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell,
            partition_dir: partition_dir.into(),
        }
    }

    fn check_root(&self) -> Result<(), ProbeError> {
        let output = self.shell.run(&CommandSpec::new("id", ["-u"]))?;
        let uid = output.first_line();
        if output.success() && uid == "0" {
            Ok(())
        } else if output.success() {
            Err(ProbeError::NoRoot(format!("running as uid {}", uid)))
        } else {
            Err(ProbeError::NoRoot(format!(
                "root check exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }

    fn has_bootloader_access(&self) -> Result<bool, ShellError> {
        let shell = self.shell.as_ref();
        let oem_unlock_supported = getprop(shell, "ro.oem_unlock_supported")? == "1";
        let flash_locked = getprop(shell, "ro.boot.flash.locked")?;
        Ok(oem_unlock_supported || flash_locked == "0")
    }

    fn has_recovery_access(&self) -> Result<bool, ShellError> {
        let recovery = self.partition_dir.join("recovery");
        let output = self.shell.run(&CommandSpec::new(
            "ls",
            [recovery.to_string_lossy().into_owned()],
        ))?;
        Ok(output.success())
    }

    fn has_system_write_access(&self) -> Result<bool, ShellError> {
        let mounts = self.shell.run(&CommandSpec::new("cat", ["/proc/mounts"]))?;
        if mounts.success() && system_mounted_rw(&mounts.stdout) {
            return Ok(true);
        }
        Ok(getprop(self.shell.as_ref(), "ro.boot.veritymode")? == "disabled")
    }
}

impl CapabilityProbe for ShellCapabilityProbe {
    fn probe(&self) -> Result<DeviceCapabilities, ProbeError> {
        self.check_root()?;
        let shell = self.shell.as_ref();

        let caps = DeviceCapabilities {
            has_root_access: true,
            has_bootloader_access: self.has_bootloader_access()?,
            has_recovery_access: self.has_recovery_access()?,
            has_system_write_access: self.has_system_write_access()?,
            supported_architectures: parse_abilist(&getprop(shell, "ro.product.cpu.abilist")?),
            device_model: getprop(shell, "ro.product.model")?,
            os_version: getprop(shell, "ro.build.version.release")?,
            security_patch_level: getprop(shell, "ro.build.version.security_patch")?,
        };
        debug!(
            model = %caps.device_model,
            bootloader = caps.has_bootloader_access,
            recovery = caps.has_recovery_access,
            system_write = caps.has_system_write_access,
            "capabilities probed"
        );
        Ok(caps)
    }
}

fn parse_abilist(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether `/system` (or `/` on system-as-root devices) is mounted read-write.
fn system_mounted_rw(proc_mounts: &str) -> bool {
    proc_mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let (_dev, mount_point, _fstype, options) =
            (fields.next(), fields.next(), fields.next(), fields.next());
        matches!(mount_point, Some("/system") | Some("/"))
            && options.is_some_and(|o| o.split(',').any(|opt| opt == "rw"))
    })
}
