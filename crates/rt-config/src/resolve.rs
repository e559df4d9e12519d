//! Configuration resolution and path discovery.
//!
//! Resolution order: CLI arguments → environment variables → XDG paths →
//! system config → defaults.

use std::path::{Path, PathBuf};

/// Discovered configuration file paths.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// Path to policy.json (or None if not found).
    pub policy: Option<PathBuf>,

    /// Path to layout.json (or None if not found).
    pub layout: Option<PathBuf>,

    pub policy_source: ConfigSource,
    pub layout_source: ConfigSource,
}

/// Where a configuration file was found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicitly provided via CLI argument.
    CliArgument,

    /// Set via environment variable.
    Environment,

    /// Found in XDG config directory.
    XdgConfig,

    /// Found in /etc/romtools/.
    SystemConfig,

    /// Using built-in defaults.
    #[default]
    BuiltinDefault,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::XdgConfig => write!(f, "XDG config"),
            ConfigSource::SystemConfig => write!(f, "system config"),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

pub const ENV_POLICY_PATH: &str = "ROMTOOLS_POLICY";
pub const ENV_LAYOUT_PATH: &str = "ROMTOOLS_LAYOUT";
pub const ENV_CONFIG_DIR: &str = "ROMTOOLS_CONFIG_DIR";

pub const POLICY_FILENAME: &str = "policy.json";
pub const LAYOUT_FILENAME: &str = "layout.json";

/// Application name for XDG directories.
const APP_NAME: &str = "romtools";

/// Resolve configuration paths using the standard resolution order.
///
/// Resolution order for each config file:
/// 1. Explicit CLI path (if provided and present)
/// 2. Environment variable (ROMTOOLS_POLICY, ROMTOOLS_LAYOUT)
/// 3. ROMTOOLS_CONFIG_DIR environment variable + filename
/// 4. XDG config directory (~/.config/romtools/)
/// 5. System config (/etc/romtools/)
/// 6. Built-in defaults (None)
pub fn resolve_config(cli_policy: Option<&Path>, cli_layout: Option<&Path>) -> ConfigPaths {
    let mut paths = ConfigPaths::default();

    paths.policy = resolve_single_config(
        cli_policy,
        ENV_POLICY_PATH,
        POLICY_FILENAME,
        &mut paths.policy_source,
    );

    paths.layout = resolve_single_config(
        cli_layout,
        ENV_LAYOUT_PATH,
        LAYOUT_FILENAME,
        &mut paths.layout_source,
    );

    paths
}

/// Resolve both files from a single CLI-provided directory.
pub fn resolve_config_dir(cli_dir: Option<&Path>) -> ConfigPaths {
    let policy = cli_dir.map(|d| d.join(POLICY_FILENAME));
    let layout = cli_dir.map(|d| d.join(LAYOUT_FILENAME));
    resolve_config(policy.as_deref(), layout.as_deref())
}

fn resolve_single_config(
    cli_path: Option<&Path>,
    env_var: &str,
    filename: &str,
    source: &mut ConfigSource,
) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        if path.exists() {
            *source = ConfigSource::CliArgument;
            return Some(path.to_path_buf());
        }
    }

    if let Ok(env_path) = std::env::var(env_var) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            *source = ConfigSource::Environment;
            return Some(path);
        }
    }

    if let Ok(config_dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = PathBuf::from(config_dir).join(filename);
        if path.exists() {
            *source = ConfigSource::Environment;
            return Some(path);
        }
    }

    if let Some(dir) = xdg_config_dir() {
        let path = dir.join(filename);
        if path.exists() {
            *source = ConfigSource::XdgConfig;
            return Some(path);
        }
    }

    let system_path = system_config_dir().join(filename);
    if system_path.exists() {
        *source = ConfigSource::SystemConfig;
        return Some(system_path);
    }

    *source = ConfigSource::BuiltinDefault;
    None
}

/// XDG config directory for romtools. Honors `XDG_CONFIG_HOME` when set.
pub fn xdg_config_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg).join(APP_NAME));
        }
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Get the system config directory.
pub fn system_config_dir() -> PathBuf {
    PathBuf::from("/etc").join(APP_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_source_display() {
        assert_eq!(format!("{}", ConfigSource::CliArgument), "CLI argument");
        assert_eq!(format!("{}", ConfigSource::XdgConfig), "XDG config");
        assert_eq!(format!("{}", ConfigSource::BuiltinDefault), "builtin default");
    }

    #[test]
    fn test_system_config_dir() {
        assert_eq!(system_config_dir(), PathBuf::from("/etc/romtools"));
    }

    #[test]
    fn test_missing_cli_path_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("nope.json");
        let mut source = ConfigSource::default();
        let resolved =
            resolve_single_config(Some(&missing), "ROMTOOLS_TEST_UNSET_VAR", "nope.json", &mut source);
        assert_ne!(resolved.as_deref(), Some(missing.as_path()));
        assert_ne!(source, ConfigSource::CliArgument);
    }
}
