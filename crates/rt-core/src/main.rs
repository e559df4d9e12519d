//! romtools - rooted-device modification orchestrator
//!
//! The main entry point for the romtools CLI, handling:
//! - Capability probing and safety checks
//! - Gated unlock, lock, flash and boot operations with rollback
//! - Partition backups and resumable image downloads
//! - Host-app retention across ROM wipes

use clap::{Args, CommandFactory, Parser, Subcommand};
use rt_common::{
    format_error_human, BackupName, OperationKind, OutputFormat, StructuredError, SCHEMA_VERSION,
};
use rt_config::{resolve_config, resolve_config_dir, Config, ConfigPaths};
use rt_core::cancel::CancellationToken;
use rt_core::events::{JsonlWriter, NullSink, ProgressSink};
use rt_core::exit_codes::ExitCode;
use rt_core::flash::{FileSource, ImageFile, ImageSource};
use rt_core::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use rt_core::pipeline::{OperationRequest, PipelineError, WarningAcknowledgement};
use rt_core::RomTools;
use serde::Serialize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// romtools - safe bootloader, recovery and partition operations
#[derive(Parser)]
#[command(name = "romtools")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Directory holding policy.json and layout.json
    #[arg(long, global = true, env = "ROMTOOLS_CONFIG_DIR")]
    config: Option<PathBuf>,

    /// Explicit policy file
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Explicit layout file
    #[arg(long, global = true)]
    layout: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Report root, bootloader, recovery and system-write capabilities
    Probe,

    /// Evaluate the safety gate for an operation without running it
    Check(CheckArgs),

    /// Run an operation through probe, gate, backup, execute and verify
    Run(RunArgs),

    /// Partition backups
    Backup(BackupArgs),

    /// Fetch an image, resuming a previous partial download
    Download(DownloadArgs),

    /// Keep the host app alive across a ROM flash
    Retention(RetentionArgs),

    /// Configuration management
    Config(ConfigArgs),

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },

    /// Print version information
    Version,
}

// ============================================================================
// Command argument structs
// ============================================================================

#[derive(Args, Debug)]
struct TargetArgs {
    /// Image to flash or boot
    #[arg(long)]
    image: Option<PathBuf>,

    /// Expected SHA-256 of the image
    #[arg(long)]
    sha256: Option<String>,

    /// Target partition (flash-partition; flash-recovery defaults to recovery)
    #[arg(long)]
    partition: Option<String>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(value_enum)]
    operation: OperationKind,

    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(value_enum)]
    operation: OperationKind,

    #[command(flatten)]
    target: TargetArgs,

    /// Proceed when the gate reports warnings only
    #[arg(long)]
    acknowledge_warnings: bool,

    /// Stage host-app retention before the write and reinstall afterwards
    #[arg(long)]
    retain: bool,

    /// Name for the pre-operation backup
    #[arg(long)]
    backup_name: Option<String>,
}

#[derive(Args, Debug)]
struct BackupArgs {
    #[command(subcommand)]
    command: BackupCommands,
}

#[derive(Subcommand, Debug)]
enum BackupCommands {
    /// Capture partitions (default: the configured bootloader partitions)
    Create {
        /// Backup name (default: timestamped)
        #[arg(long)]
        name: Option<String>,

        /// Partition to capture; repeatable
        #[arg(long = "partition")]
        partitions: Vec<String>,
    },
    /// List backups, oldest first
    List,
    /// Verify a backup and write it back
    Restore { name: String },
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// Local path, or an http(s) URL when built with the `http` feature
    source: String,

    /// Destination; relative paths land in the download directory
    dest: PathBuf,

    /// Expected SHA-256 of the complete file
    #[arg(long)]
    sha256: Option<String>,
}

#[derive(Args, Debug)]
struct RetentionArgs {
    #[command(subcommand)]
    command: RetentionCommands,
}

#[derive(Subcommand, Debug)]
enum RetentionCommands {
    /// Stage every retention mechanism
    Setup,
    /// Reinstall the app and its data after a flash
    Restore,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration files
    Validate {
        /// A policy file, a layout file, or a directory holding both
        path: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_format = match cli.global.format {
        OutputFormat::Jsonl => Some(LogFormat::Jsonl),
        _ => None,
    };
    let log_config = LogConfig::from_env(
        LogLevel::from_verbosity(cli.global.verbose, cli.global.quiet),
        log_format,
    );
    init_logging(&log_config);

    let global = &cli.global;
    let exit_code = match &cli.command {
        Commands::Probe => run_probe(global),
        Commands::Check(args) => run_check(global, args),
        Commands::Run(args) => run_operation(global, args),
        Commands::Backup(args) => run_backup(global, args),
        Commands::Download(args) => run_download(global, args),
        Commands::Retention(args) => run_retention(global, args),
        Commands::Config(args) => run_config(global, args),
        Commands::Completions { shell } => {
            clap_complete::generate(
                *shell,
                &mut Cli::command(),
                "romtools",
                &mut std::io::stdout(),
            );
            ExitCode::Ok
        }
        Commands::Version => {
            print_version(global);
            ExitCode::Ok
        }
    };

    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// Setup
// ============================================================================

fn config_paths(global: &GlobalOpts) -> ConfigPaths {
    if global.policy.is_some() || global.layout.is_some() {
        resolve_config(global.policy.as_deref(), global.layout.as_deref())
    } else {
        resolve_config_dir(global.config.as_deref())
    }
}

fn load_config(global: &GlobalOpts) -> Result<Config, rt_common::Error> {
    Config::load(config_paths(global)).map_err(|e| rt_common::Error::Config(e.to_string()))
}

fn open_device(global: &GlobalOpts) -> Result<RomTools, ExitCode> {
    let config = load_config(global).map_err(|e| output_error(global, &e))?;
    RomTools::for_device(config).map_err(|e| output_error(global, &e))
}

/// Progress goes to stdout only when the caller asked for a stream.
fn progress_sink(global: &GlobalOpts) -> Arc<dyn ProgressSink> {
    match global.format {
        OutputFormat::Jsonl => Arc::new(JsonlWriter::new(std::io::stdout())),
        _ => Arc::new(NullSink),
    }
}

fn build_request(
    operation: OperationKind,
    target: &TargetArgs,
) -> Result<OperationRequest, rt_common::Error> {
    let mut request = OperationRequest::new(operation);
    if let Some(path) = &target.image {
        request = request.with_image(ImageFile::inspect(path, target.sha256.as_deref())?);
    }
    if let Some(partition) = &target.partition {
        request = request.with_partition(partition.clone());
    }
    Ok(request)
}

fn parse_backup_name(name: &str) -> Result<BackupName, rt_common::Error> {
    BackupName::new(name).map_err(|e| rt_common::Error::Config(e.to_string()))
}

// ============================================================================
// Command implementations
// ============================================================================

fn run_probe(global: &GlobalOpts) -> ExitCode {
    let tools = match open_device(global) {
        Ok(t) => t,
        Err(code) => return code,
    };
    match tools.probe_capabilities() {
        Ok(caps) => {
            let summary = format!(
                "{} (Android {}, patch {}): bootloader={} recovery={} system_write={}",
                caps.device_model,
                caps.os_version,
                caps.security_patch_level,
                caps.has_bootloader_access,
                caps.has_recovery_access,
                caps.has_system_write_access
            );
            output(global, "probe", &caps, &summary);
            ExitCode::Ok
        }
        Err(e) => output_error(global, &e),
    }
}

fn run_check(global: &GlobalOpts, args: &CheckArgs) -> ExitCode {
    let request = match build_request(args.operation, &args.target) {
        Ok(r) => r,
        Err(e) => return output_error(global, &e),
    };
    let tools = match open_device(global) {
        Ok(t) => t,
        Err(code) => return code,
    };
    match tools.check_safety(&request) {
        Ok(result) => {
            let verdict = if !result.passed {
                "blocked"
            } else if result.warnings.is_empty() {
                "passed"
            } else {
                "passed with warnings"
            };
            let mut summary = format!("{}: {}", args.operation, verdict);
            for issue in result.critical_issues.iter().chain(&result.warnings) {
                summary.push_str(&format!("\n  - {}", issue));
            }
            output(global, "check", &result, &summary);
            if result.passed {
                ExitCode::Ok
            } else {
                ExitCode::Blocked
            }
        }
        Err(e) => output_error(global, &e),
    }
}

fn run_operation(global: &GlobalOpts, args: &RunArgs) -> ExitCode {
    let mut request = match build_request(args.operation, &args.target) {
        Ok(r) => r.with_retention(args.retain),
        Err(e) => return output_error(global, &e),
    };
    if let Some(name) = &args.backup_name {
        match parse_backup_name(name) {
            Ok(name) => request = request.with_backup_name(name),
            Err(e) => return output_error(global, &e),
        }
    }
    let tools = match open_device(global) {
        Ok(t) => t,
        Err(code) => return code,
    };

    let sink = progress_sink(global);
    let result = tools.run_operation(
        &request,
        WarningAcknowledgement::from_flag(args.acknowledge_warnings),
        sink.as_ref(),
        &CancellationToken::new(),
    );
    match result {
        Ok(report) => {
            let mut summary = format!(
                "[{}] {}: {}",
                report.run_id,
                report.operation,
                report.final_state()
            );
            for issue in report.outcome.issues() {
                summary.push_str(&format!("\n  - {}", issue));
            }
            output(global, "run", &report, &summary);
            ExitCode::for_outcome(&report.outcome)
        }
        Err(e) => output_pipeline_error(global, e),
    }
}

fn run_backup(global: &GlobalOpts, args: &BackupArgs) -> ExitCode {
    let tools = match open_device(global) {
        Ok(t) => t,
        Err(code) => return code,
    };
    let result = match &args.command {
        BackupCommands::Create { name, partitions } => {
            let name = match name {
                Some(n) => parse_backup_name(n),
                None => BackupName::timestamped(&tools.config().policy.backup.name_prefix)
                    .map_err(|e| rt_common::Error::Config(e.to_string())),
            };
            name.and_then(|n| tools.create_backup(&n, partitions))
                .map(|info| {
                    let summary = format!(
                        "created {} ({} bytes): {}",
                        info.name,
                        info.size_bytes,
                        info.partitions.join(", ")
                    );
                    output(global, "backup create", &info, &summary);
                    ExitCode::Ok
                })
        }
        BackupCommands::List => tools.list_backups().map(|backups| {
            let summary = backups
                .iter()
                .map(|b| format!("{}  {}  {}", b.name, b.device_model, b.partitions.join(",")))
                .collect::<Vec<_>>()
                .join("\n");
            output(global, "backup list", &backups, &summary);
            ExitCode::Ok
        }),
        BackupCommands::Restore { name } => parse_backup_name(name)
            .and_then(|n| tools.find_backup(&n))
            .and_then(|info| tools.restore_backup(&info))
            .map(|validation| {
                let summary = if validation.success {
                    format!("restored {}", name)
                } else {
                    format!("restore of {} failed: {}", name, validation.issues.join("; "))
                };
                output(global, "backup restore", &validation, &summary);
                if validation.success {
                    ExitCode::Ok
                } else {
                    ExitCode::Failed
                }
            }),
    };
    result.unwrap_or_else(|e| output_error(global, &e))
}

fn image_source(source: &str, timeout_secs: u64) -> Result<Box<dyn ImageSource>, rt_common::Error> {
    if source.starts_with("http://") || source.starts_with("https://") {
        #[cfg(feature = "http")]
        {
            return Ok(Box::new(rt_core::flash::HttpSource::new(
                source,
                std::time::Duration::from_secs(timeout_secs),
            )));
        }
        #[cfg(not(feature = "http"))]
        {
            let _ = timeout_secs;
            return Err(rt_common::Error::Config(
                "remote sources need a build with the `http` feature".to_string(),
            ));
        }
    }
    Ok(Box::new(FileSource::new(source)))
}

fn run_download(global: &GlobalOpts, args: &DownloadArgs) -> ExitCode {
    let tools = match open_device(global) {
        Ok(t) => t,
        Err(code) => return code,
    };
    let source = match image_source(&args.source, tools.config().policy.download.timeout_secs) {
        Ok(s) => s,
        Err(e) => return output_error(global, &e),
    };
    let sink = progress_sink(global);
    match tools.download(
        source.as_ref(),
        &args.dest,
        args.sha256.as_deref(),
        sink.as_ref(),
        &CancellationToken::new(),
    ) {
        Ok(report) => {
            let summary = format!(
                "{}: {} bytes, sha256 {} (resumed from {})",
                report.dest.display(),
                report.bytes,
                report.sha256,
                report.resumed_from
            );
            output(global, "download", &report, &summary);
            ExitCode::Ok
        }
        Err(e) => output_error(global, &e),
    }
}

fn run_retention(global: &GlobalOpts, args: &RetentionArgs) -> ExitCode {
    let tools = match open_device(global) {
        Ok(t) => t,
        Err(code) => return code,
    };
    let result = match args.command {
        RetentionCommands::Setup => tools.setup_retention().map(|status| {
            let staged: Vec<String> = status
                .mechanisms
                .iter()
                .map(|(m, ok)| format!("{}={}", m, if *ok { "ok" } else { "unavailable" }))
                .collect();
            output(global, "retention setup", &status, &staged.join(" "));
            if status.success_count() > 0 {
                ExitCode::Ok
            } else {
                ExitCode::Failed
            }
        }),
        RetentionCommands::Restore => tools.restore_after_flash().map(|report| {
            let summary = format!(
                "apk reinstalled: {}, data restored: {}",
                report.apk_reinstalled, report.data_restored
            );
            output(global, "retention restore", &report, &summary);
            ExitCode::Ok
        }),
    };
    result.unwrap_or_else(|e| output_error(global, &e))
}

fn run_config(global: &GlobalOpts, args: &ConfigArgs) -> ExitCode {
    match &args.command {
        ConfigCommands::Show => run_config_show(global),
        ConfigCommands::Validate { path } => run_config_validate(global, path.as_deref()),
    }
}

/// Display the effective configuration (including defaults if no files present).
fn run_config_show(global: &GlobalOpts) -> ExitCode {
    let config = match load_config(global) {
        Ok(c) => c,
        Err(e) => return output_error(global, &e),
    };
    let response = serde_json::json!({
        "policy": config.policy,
        "layout": config.layout,
        "snapshot": config.snapshot,
    });
    let summary = format!(
        "config {}: policy from {}, layout from {}",
        config.snapshot.short_id(),
        config.paths.policy_source,
        config.paths.layout_source
    );
    output(global, "config show", &response, &summary);
    ExitCode::Ok
}

fn run_config_validate(global: &GlobalOpts, path: Option<&Path>) -> ExitCode {
    let paths = match path {
        Some(p) if p.is_dir() => resolve_config_dir(Some(p)),
        Some(p) if p.to_string_lossy().contains("layout") => resolve_config(None, Some(p)),
        Some(p) => resolve_config(Some(p), None),
        None => config_paths(global),
    };
    match Config::load(paths) {
        Ok(config) => {
            let response = serde_json::json!({
                "status": "valid",
                "policy": {
                    "path": config.paths.policy.as_ref().map(|p| p.display().to_string()),
                    "source": config.paths.policy_source.to_string(),
                },
                "layout": {
                    "path": config.paths.layout.as_ref().map(|p| p.display().to_string()),
                    "source": config.paths.layout_source.to_string(),
                },
                "combined_hash": config.snapshot.combined_hash,
            });
            output(global, "config validate", &response, "config validate: OK");
            ExitCode::Ok
        }
        Err(e) => output_error(global, &rt_common::Error::Config(e.to_string())),
    }
}

fn print_version(global: &GlobalOpts) {
    let version_info = serde_json::json!({
        "romtools_version": env!("CARGO_PKG_VERSION"),
        "rust_version": env!("CARGO_PKG_RUST_VERSION"),
        "http": cfg!(feature = "http"),
    });
    let summary = format!("romtools {}", env!("CARGO_PKG_VERSION"));
    output(global, "version", &version_info, &summary);
}

// ============================================================================
// Output
// ============================================================================

fn output<T: Serialize>(global: &GlobalOpts, command: &str, result: &T, summary: &str) {
    let envelope = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "command": command,
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "result": result,
    });
    match global.format {
        OutputFormat::Json => match serde_json::to_string_pretty(&envelope) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("failed to serialize {} output: {}", command, e),
        },
        OutputFormat::Jsonl => println!("{}", envelope),
        OutputFormat::Summary => {
            if !summary.is_empty() {
                println!("{}", summary);
            }
        }
    }
}

fn output_pipeline_error(global: &GlobalOpts, err: PipelineError) -> ExitCode {
    let code = ExitCode::for_pipeline_error(&err);
    print_error(global, &rt_common::Error::from(err), code);
    code
}

fn output_error(global: &GlobalOpts, err: &rt_common::Error) -> ExitCode {
    let code = ExitCode::for_error(err);
    print_error(global, err, code);
    code
}

fn print_error(global: &GlobalOpts, err: &rt_common::Error, code: ExitCode) {
    match global.format {
        OutputFormat::Json | OutputFormat::Jsonl => {
            let structured =
                StructuredError::from(err).with_context("exit_code", code.code_name());
            eprintln!("{}", structured.to_json());
        }
        OutputFormat::Summary => {
            eprintln!("{}", format_error_human(err, std::io::stderr().is_terminal()));
        }
    }
}
