//! Configuration resolution and loading against real files.
//!
//! Covers:
//! - Resolution order (CLI > env > config dir > XDG)
//! - Loading partial files over defaults
//! - Rejection of semantically invalid files

use rt_config::resolve::{resolve_config, ConfigSource};
use rt_config::{Config, ValidationError};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tempfile::TempDir;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

const KEYS: [&str; 4] = [
    "ROMTOOLS_POLICY",
    "ROMTOOLS_LAYOUT",
    "ROMTOOLS_CONFIG_DIR",
    "XDG_CONFIG_HOME",
];

struct EnvGuard {
    saved: Vec<(String, Option<String>)>,
}

impl EnvGuard {
    fn new(keys: &[&str]) -> Self {
        let saved = keys
            .iter()
            .map(|k| (k.to_string(), env::var(k).ok()))
            .collect();
        for key in keys {
            env::remove_var(key);
        }
        Self { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            match value {
                Some(val) => env::set_var(key, val),
                None => env::remove_var(key),
            }
        }
    }
}

fn with_env_lock<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f()
}

fn write_config_dir(dir: &Path, min_battery: u8) {
    fs::create_dir_all(dir).expect("create config dir");
    fs::write(
        dir.join("policy.json"),
        format!(
            r#"{{"schema_version":"1.0.0","safety":{{"min_battery_percent":{}}}}}"#,
            min_battery
        ),
    )
    .expect("write policy");
    fs::write(
        dir.join("layout.json"),
        r#"{"schema_version":"1.0.0","partition_dir":"/tmp/by-name"}"#,
    )
    .expect("write layout");
}

#[test]
fn test_cli_over_env() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(&KEYS);
        let temp = TempDir::new().expect("temp dir");
        let cli_dir = temp.path().join("cli");
        let env_dir = temp.path().join("env");
        write_config_dir(&cli_dir, 70);
        write_config_dir(&env_dir, 60);

        env::set_var("ROMTOOLS_POLICY", env_dir.join("policy.json"));
        env::set_var("ROMTOOLS_CONFIG_DIR", &env_dir);

        let cli_policy = cli_dir.join("policy.json");
        let paths = resolve_config(Some(&cli_policy), None);
        assert_eq!(paths.policy_source, ConfigSource::CliArgument);
        assert_eq!(paths.layout_source, ConfigSource::Environment);

        let config = Config::load(paths).expect("load");
        assert_eq!(config.policy.safety.min_battery_percent, 70);
        assert!(config.snapshot.policy_hash.is_some());
    });
}

#[test]
fn test_env_over_config_dir() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(&KEYS);
        let temp = TempDir::new().expect("temp dir");
        let env_dir = temp.path().join("env");
        let config_dir = temp.path().join("config_dir");
        write_config_dir(&env_dir, 60);
        write_config_dir(&config_dir, 55);

        env::set_var("ROMTOOLS_POLICY", env_dir.join("policy.json"));
        env::set_var("ROMTOOLS_CONFIG_DIR", &config_dir);

        let paths = resolve_config(None, None);
        assert_eq!(paths.policy.as_deref(), Some(env_dir.join("policy.json").as_path()));
        assert_eq!(paths.layout.as_deref(), Some(config_dir.join("layout.json").as_path()));
    });
}

#[test]
fn test_xdg_fallback() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(&KEYS);
        let temp = TempDir::new().expect("temp dir");
        let xdg_dir = temp.path().join("xdg");
        let app_dir = xdg_dir.join("romtools");
        write_config_dir(&app_dir, 65);

        env::set_var("XDG_CONFIG_HOME", &xdg_dir);

        let paths = resolve_config(None, None);
        assert_eq!(paths.policy_source, ConfigSource::XdgConfig);
        assert_eq!(paths.layout_source, ConfigSource::XdgConfig);
        let config = Config::load(paths).expect("load");
        assert_eq!(config.policy.safety.min_battery_percent, 65);
        assert_eq!(config.layout.partition_dir, Path::new("/tmp/by-name"));
    });
}

#[test]
fn test_invalid_policy_is_rejected_on_load() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(&KEYS);
        let temp = TempDir::new().expect("temp dir");
        let policy = temp.path().join("policy.json");
        fs::write(
            &policy,
            r#"{"schema_version":"1.0.0","safety":{"max_status_age_ms":0}}"#,
        )
        .unwrap();

        let paths = resolve_config(Some(&policy), None);
        let err = Config::load(paths).expect_err("zero status age must be rejected");
        assert!(matches!(err, ValidationError::InvalidValue { .. }));
    });
}
