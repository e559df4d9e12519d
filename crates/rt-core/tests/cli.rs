//! CLI tests for the romtools binary.
//!
//! Only commands that do not touch a device run here; device commands are
//! covered by the library-level scenario tests.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

/// A romtools command isolated from the caller's config files.
fn romtools(config_home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("romtools").expect("romtools binary should exist");
    cmd.env("XDG_CONFIG_HOME", config_home.path())
        .env_remove("ROMTOOLS_CONFIG_DIR")
        .env_remove("ROMTOOLS_POLICY")
        .env_remove("ROMTOOLS_LAYOUT")
        .env_remove("ROMTOOLS_LOG");
    cmd
}

fn stdout_json(cmd: &mut Command) -> Value {
    let output = cmd.output().expect("run romtools");
    assert!(output.status.success(), "{:?}", output);
    serde_json::from_slice(&output.stdout).expect("stdout is one JSON document")
}

fn write_policy(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("policy.json");
    fs::write(&path, body).unwrap();
    path
}

// ============================================================================
// Informational commands
// ============================================================================

mod info {
    use super::*;

    #[test]
    fn version_reports_package_version() {
        let home = TempDir::new().unwrap();
        let doc = stdout_json(romtools(&home).arg("version"));
        assert_eq!(doc["command"], "version");
        assert_eq!(doc["schema_version"], "1.0.0");
        assert_eq!(doc["result"]["romtools_version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn version_summary_format() {
        let home = TempDir::new().unwrap();
        romtools(&home)
            .args(["-f", "summary", "version"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("romtools "));
    }

    #[test]
    fn completions_for_bash() {
        let home = TempDir::new().unwrap();
        romtools(&home)
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("romtools"));
    }
}

// ============================================================================
// Configuration
// ============================================================================

mod config {
    use super::*;

    #[test]
    fn show_uses_builtin_defaults() {
        let home = TempDir::new().unwrap();
        let doc = stdout_json(romtools(&home).args(["config", "show"]));
        let result = &doc["result"];
        assert_eq!(result["policy"]["safety"]["min_battery_percent"], 50);
        assert_eq!(result["policy"]["backup"]["name_prefix"], "auto");
        assert_eq!(
            result["layout"]["partition_dir"],
            "/dev/block/by-name"
        );
    }

    #[test]
    fn show_reads_config_dir() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        write_policy(
            &dir,
            r#"{"schema_version": "1.0.0", "safety": {"min_battery_percent": 70}}"#,
        );
        let doc = stdout_json(
            romtools(&home)
                .arg("--config")
                .arg(dir.path())
                .args(["config", "show"]),
        );
        assert_eq!(doc["result"]["policy"]["safety"]["min_battery_percent"], 70);
        assert_eq!(doc["result"]["policy"]["safety"]["low_battery_warning_percent"], 30);
    }

    #[test]
    fn validate_accepts_good_policy() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let policy = write_policy(&dir, r#"{"schema_version": "1.0.0"}"#);
        let doc = stdout_json(romtools(&home).args(["config", "validate"]).arg(&policy));
        assert_eq!(doc["result"]["status"], "valid");
        assert_eq!(doc["result"]["policy"]["source"], "CLI argument");
        assert_eq!(doc["result"]["layout"]["source"], "builtin default");
    }

    #[test]
    fn validate_rejects_out_of_range_battery() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let policy = write_policy(
            &dir,
            r#"{"schema_version": "1.0.0", "safety": {"min_battery_percent": 150}}"#,
        );
        romtools(&home)
            .args(["config", "validate"])
            .arg(&policy)
            .assert()
            .code(10)
            .stderr(predicate::str::contains("min_battery_percent"))
            .stderr(predicate::str::contains("ERR_ARGS"));
    }

    #[test]
    fn summary_format_prints_human_error() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let policy = write_policy(
            &dir,
            r#"{"schema_version": "1.0.0", "safety": {"min_battery_percent": 150}}"#,
        );
        romtools(&home)
            .args(["-f", "summary", "config", "validate"])
            .arg(&policy)
            .assert()
            .code(10)
            .stderr(predicate::str::contains("Reason:"))
            .stderr(predicate::str::contains("Fix:"))
            .stderr(predicate::str::contains("ERR_ARGS").not());
    }

    #[test]
    fn validate_rejects_wrong_schema_version() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        write_policy(&dir, r#"{"schema_version": "9.9.9"}"#);
        romtools(&home)
            .args(["config", "validate"])
            .arg(dir.path())
            .assert()
            .code(10);
    }
}

// ============================================================================
// Argument errors
// ============================================================================

mod invalid_args {
    use super::*;

    #[test]
    fn unknown_command_fails() {
        let home = TempDir::new().unwrap();
        romtools(&home)
            .arg("nonexistent-command")
            .assert()
            .code(2)
            .stderr(predicate::str::contains("error"));
    }

    #[test]
    fn unknown_operation_fails() {
        let home = TempDir::new().unwrap();
        romtools(&home)
            .args(["check", "format-userdata"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("error"));
    }

    #[test]
    fn invalid_backup_name_is_rejected_before_touching_device() {
        let home = TempDir::new().unwrap();
        romtools(&home)
            .args(["run", "unlock", "--backup-name", "../escape"])
            .assert()
            .code(10)
            .stderr(predicate::str::contains("ERR_ARGS"));
    }

    #[test]
    fn flash_without_image_is_rejected() {
        let home = TempDir::new().unwrap();
        romtools(&home)
            .args(["check", "flash-partition", "--image"])
            .assert()
            .code(2);
    }
}
