//! Host-application retention across ROM wipes.
//!
//! Four independent mechanisms are staged into the retention root under
//! fixed names. An artifact exists iff its mechanism succeeded on the most
//! recent setup, so repeated setups overwrite in place.

mod scripts;

use crate::shell::{run_checked, CheckedError, CommandSpec, PrivilegedShell};
use rt_common::{RetentionMechanism, RetentionStatus};
use rt_config::{AppTarget, Layout};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const APK_FILE_NAME: &str = "app.apk";
pub const DATA_ARCHIVE_NAME: &str = "app_data.tar.gz";
pub const MAGISK_DIR_NAME: &str = "magisk_module";

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("retention artifact missing: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("could not locate the installed APK for {0}")]
    ApkNotFound(String),

    #[error(transparent)]
    Command(#[from] CheckedError),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<RetentionError> for rt_common::Error {
    fn from(err: RetentionError) -> Self {
        match err {
            RetentionError::Command(CheckedError::Failed(failed)) => failed.into(),
            RetentionError::Command(CheckedError::Shell(e)) => {
                rt_common::Error::ShellUnavailable(e.to_string())
            }
            RetentionError::Io(e) => rt_common::Error::Io(e),
            other => rt_common::Error::Io(io::Error::other(other.to_string())),
        }
    }
}

/// Outcome of reinstalling the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub apk_reinstalled: bool,
    pub data_restored: bool,
}

pub trait RetentionManager: Send + Sync {
    /// Attempt every mechanism independently. The returned status always
    /// carries exactly one entry per mechanism.
    fn setup_retention(&self) -> Result<RetentionStatus, RetentionError>;

    /// Reinstall the retained APK and, when archived, restore app data.
    fn restore_after_flash(&self) -> Result<RestoreReport, RetentionError>;
}

/// Stages artifacts on the local filesystem and installs them through the
/// privileged shell.
pub struct ArtifactRetention {
    shell: Arc<dyn PrivilegedShell>,
    root: PathBuf,
    addon_d_dir: PathBuf,
    magisk_modules_dir: PathBuf,
    magisk_marker: PathBuf,
    app: AppTarget,
}

impl ArtifactRetention {
    pub fn new(shell: Arc<dyn PrivilegedShell>, layout: &Layout) -> Self {
        Self {
            shell,
            root: layout.retention_root.clone(),
            addon_d_dir: layout.addon_d_dir.clone(),
            magisk_modules_dir: layout.magisk_modules_dir.clone(),
            magisk_marker: layout.magisk_marker.clone(),
            app: layout.app.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String, RetentionError> {
        let spec = CommandSpec::new(program, args.iter().copied());
        Ok(run_checked(self.shell.as_ref(), &spec)?.stdout)
    }

    fn installed_apk(&self) -> Result<String, RetentionError> {
        if let Some(path) = &self.app.apk_path {
            return Ok(path.display().to_string());
        }
        let out = self.run("pm", &["path", &self.app.package_identifier])?;
        out.lines()
            .find_map(|l| l.trim().strip_prefix("package:"))
            .map(str::to_string)
            .ok_or_else(|| RetentionError::ApkNotFound(self.app.package_identifier.clone()))
    }

    fn backup_apk(&self) -> Result<(), RetentionError> {
        let source = self.installed_apk()?;
        let apk = self.artifact(APK_FILE_NAME);
        self.run("cp", &[&source, &path_str(&apk)])?;
        if !apk.is_file() {
            return Err(RetentionError::MissingArtifact(apk));
        }

        let archive = self.artifact(DATA_ARCHIVE_NAME);
        let data_dir = &self.app.data_dir;
        let parent = data_dir.parent().unwrap_or(Path::new("/"));
        let dir_name = data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tar = self.run(
            "tar",
            &[
                "-czf",
                &path_str(&archive),
                "-C",
                &path_str(parent),
                "--exclude=cache",
                "--exclude=code_cache",
                &dir_name,
            ],
        );
        if let Err(e) = tar {
            // The APK alone still lets the app come back.
            warn!(error = %e, "app data archive failed");
            let _ = fs::remove_file(&archive);
        }
        Ok(())
    }

    fn install_addon_d(&self) -> Result<(), RetentionError> {
        if !self.addon_d_dir.is_dir() {
            return Err(RetentionError::MissingArtifact(self.addon_d_dir.clone()));
        }
        let name = scripts::addon_d_script_name(&self.app);
        let staged = self.artifact(&name);
        fs::write(&staged, scripts::addon_d_script(&self.app))?;
        let target = path_str(&self.addon_d_dir.join(&name));

        self.run("mount", &["-o", "remount,rw", "/system"])?;
        let installed = self
            .run("cp", &[&path_str(&staged), &target])
            .and_then(|_| self.run("chmod", &["755", &target]))
            .and_then(|_| self.run("chown", &["root:root", &target]));
        let remounted = self.run("mount", &["-o", "remount,ro", "/system"]);
        installed?;
        remounted?;
        Ok(())
    }

    fn write_installer_zip(&self) -> Result<(), RetentionError> {
        let apk = self.artifact(APK_FILE_NAME);
        if !apk.is_file() {
            return Err(RetentionError::MissingArtifact(apk));
        }
        let target = self.artifact(&scripts::installer_zip_name(&self.app));
        let tmp = target.with_extension("zip.tmp");
        let name = &self.app.app_name;

        let result = (|| -> Result<(), RetentionError> {
            let mut zip = ZipWriter::new(File::create(&tmp)?);
            zip.start_file(
                format!("system/app/{name}/{name}.apk"),
                SimpleFileOptions::default(),
            )?;
            io::copy(&mut File::open(&apk)?, &mut zip)?;
            zip.start_file(
                "META-INF/com/google/android/updater-script",
                SimpleFileOptions::default(),
            )?;
            zip.write_all(scripts::updater_script(&self.app).as_bytes())?;
            zip.start_file(
                "META-INF/com/google/android/update-binary",
                SimpleFileOptions::default(),
            )?;
            zip.write_all(scripts::UPDATE_BINARY.as_bytes())?;
            zip.finish()?.sync_all()?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn magisk_present(&self) -> bool {
        self.magisk_marker.exists()
            || self.magisk_modules_dir.is_dir()
            || self
                .shell
                .run(&CommandSpec::new("which", ["magisk"]))
                .is_ok_and(|o| o.success())
    }

    fn install_magisk_module(&self) -> Result<(), RetentionError> {
        if !self.magisk_present() {
            return Err(RetentionError::MissingArtifact(self.magisk_marker.clone()));
        }
        let staged = self.artifact(MAGISK_DIR_NAME);
        fs::create_dir_all(&staged)?;
        fs::write(staged.join("module.prop"), scripts::module_prop(&self.app))?;
        let apk = path_str(&self.artifact(APK_FILE_NAME));
        let install = staged.join("install.sh");
        fs::write(&install, scripts::module_install_script(&self.app, &apk))?;
        set_executable(&install)?;

        let target = self.magisk_modules_dir.join(&self.app.magisk_module_id);
        fs::create_dir_all(&target)?;
        for file in ["module.prop", "install.sh"] {
            fs::copy(staged.join(file), target.join(file))?;
        }
        Ok(())
    }

    /// Remove whatever a failed mechanism may have left behind.
    fn clear(&self, mechanism: RetentionMechanism) {
        let result = match mechanism {
            RetentionMechanism::ApkBackup => fs::remove_file(self.artifact(APK_FILE_NAME))
                .and(fs::remove_file(self.artifact(DATA_ARCHIVE_NAME)).or(Ok(()))),
            RetentionMechanism::AddonDScript => {
                fs::remove_file(self.artifact(&scripts::addon_d_script_name(&self.app)))
            }
            RetentionMechanism::RecoveryZip => {
                fs::remove_file(self.artifact(&scripts::installer_zip_name(&self.app)))
            }
            RetentionMechanism::MagiskModule => {
                fs::remove_dir_all(self.artifact(MAGISK_DIR_NAME))
            }
        };
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(%mechanism, error = %e, "could not remove stale artifact");
            }
        }
    }

    fn attempt(&self, mechanism: RetentionMechanism) -> bool {
        let result = match mechanism {
            RetentionMechanism::ApkBackup => self.backup_apk(),
            RetentionMechanism::AddonDScript => self.install_addon_d(),
            RetentionMechanism::RecoveryZip => self.write_installer_zip(),
            RetentionMechanism::MagiskModule => self.install_magisk_module(),
        };
        match result {
            Ok(()) => {
                debug!(%mechanism, "retention mechanism staged");
                true
            }
            Err(e) => {
                info!(%mechanism, error = %e, "retention mechanism unavailable");
                self.clear(mechanism);
                false
            }
        }
    }
}

impl RetentionManager for ArtifactRetention {
    fn setup_retention(&self) -> Result<RetentionStatus, RetentionError> {
        fs::create_dir_all(&self.root)?;
        let mut status = RetentionStatus::new(self.root.clone(), &self.app.package_identifier);
        // Order matters: the recovery zip and module packages reuse the APK.
        for mechanism in RetentionMechanism::ALL {
            status.record(mechanism, self.attempt(mechanism));
        }
        info!(
            succeeded = status.success_count(),
            fully_protected = status.is_fully_protected(),
            "retention staged"
        );
        Ok(status)
    }

    fn restore_after_flash(&self) -> Result<RestoreReport, RetentionError> {
        let apk = self.artifact(APK_FILE_NAME);
        if !apk.is_file() {
            return Err(RetentionError::MissingArtifact(apk));
        }
        self.run("pm", &["install", "-r", &path_str(&apk)])?;

        let archive = self.artifact(DATA_ARCHIVE_NAME);
        if !archive.is_file() {
            info!("app reinstalled without data archive");
            return Ok(RestoreReport {
                apk_reinstalled: true,
                data_restored: false,
            });
        }
        let data_dir = path_str(&self.app.data_dir);
        let parent = path_str(self.app.data_dir.parent().unwrap_or(Path::new("/")));
        // The reinstall assigned a new uid; extraction would bring back the old one.
        let owner = self.run("stat", &["-c", "%u:%g", &data_dir])?;
        let owner = owner.trim();
        self.run("tar", &["-xzf", &path_str(&archive), "-C", &parent])?;
        if !owner.is_empty() {
            self.run("chown", &["-R", owner, &data_dir])?;
        }
        self.run("restorecon", &["-R", &data_dir])?;
        info!(package = %self.app.package_identifier, "app and data restored");
        Ok(RestoreReport {
            apk_reinstalled: true,
            data_restored: true,
        })
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
