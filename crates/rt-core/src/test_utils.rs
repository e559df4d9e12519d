//! Test doubles for rt-core.
//!
//! - [`FakeDevice`]: a scriptable rooted phone behind [`PrivilegedShell`]
//! - [`ScriptedShell`]: prefix-matched canned responses
//! - [`MemoryPartitions`]: in-memory partitions with fault injection
//! - [`CollectingSink`]: records progress events, with an optional hook
//!
//! Exported behind the `test-utils` feature for integration tests.

use crate::backup::FileBackupManager;
use crate::bootloader::ShellBootloader;
use crate::events::{ProgressEvent, ProgressSink};
use crate::facade::RomTools;
use crate::flash::FlashManager;
use crate::partition::PartitionStore;
use crate::pipeline::{OperationPipeline, PipelineParts, RunLock};
use crate::probe::{ShellCapabilityProbe, ShellStatusProvider};
use crate::retention::ArtifactRetention;
use crate::safety::PolicySafetyGate;
use crate::shell::{CommandOutput, CommandSpec, PrivilegedShell, ShellError};
use crate::verify::Verifier;
use rt_config::{Config, Layout, Policy};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

/// Assert that a Result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($expr:expr, $msg:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => panic!("{}: {:?}", $msg, e),
        }
    };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// In-memory partitions
// ============================================================================

#[derive(Default)]
struct PartitionState {
    data: BTreeMap<String, Vec<u8>>,
    writes: usize,
    failing: BTreeSet<String>,
    corrupt_next: BTreeSet<String>,
}

/// Partitions held in memory. A writer replaces the whole partition when it
/// is flushed or dropped.
#[derive(Clone, Default)]
pub struct MemoryPartitions {
    state: Arc<Mutex<PartitionState>>,
}

impl MemoryPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, partition: &str, data: Vec<u8>) {
        lock(&self.state).data.insert(partition.to_string(), data);
    }

    pub fn get(&self, partition: &str) -> Option<Vec<u8>> {
        lock(&self.state).data.get(partition).cloned()
    }

    /// Committed writers so far.
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }

    /// Refuse to open `partition` for writing.
    pub fn fail_writes(&self, partition: &str) {
        lock(&self.state).failing.insert(partition.to_string());
    }

    /// Flip the first byte of the next image written to `partition`.
    pub fn corrupt_next_write(&self, partition: &str) {
        lock(&self.state).corrupt_next.insert(partition.to_string());
    }
}

impl PartitionStore for MemoryPartitions {
    fn exists(&self, partition: &str) -> bool {
        lock(&self.state).data.contains_key(partition)
    }

    fn open_read(&self, partition: &str) -> io::Result<Box<dyn Read + Send>> {
        let data = self.get(partition).ok_or_else(|| not_found(partition))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_write(&self, partition: &str) -> io::Result<Box<dyn Write + Send>> {
        let mut state = lock(&self.state);
        if !state.data.contains_key(partition) {
            return Err(not_found(partition));
        }
        if state.failing.contains(partition) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is write-protected", partition),
            ));
        }
        let corrupt = state.corrupt_next.remove(partition);
        Ok(Box::new(MemoryWriter {
            partition: partition.to_string(),
            buffer: Vec::new(),
            state: Arc::clone(&self.state),
            corrupt,
            committed: false,
        }))
    }
}

fn not_found(partition: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such partition: {}", partition),
    )
}

struct MemoryWriter {
    partition: String,
    buffer: Vec<u8>,
    state: Arc<Mutex<PartitionState>>,
    corrupt: bool,
    committed: bool,
}

impl MemoryWriter {
    fn commit(&mut self) {
        let mut state = lock(&self.state);
        let mut data = self.buffer.clone();
        if self.corrupt {
            if let Some(first) = data.first_mut() {
                *first ^= 0xff;
            }
        }
        state.data.insert(self.partition.clone(), data);
        if !self.committed {
            state.writes += 1;
            self.committed = true;
        }
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit();
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if !self.committed {
            self.commit();
        }
    }
}

// ============================================================================
// Scripted shell
// ============================================================================

/// Answers by command-line prefix; the most recently added match wins and
/// unmatched commands exit 127.
#[derive(Default)]
pub struct ScriptedShell {
    responses: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        lock(&self.responses).push((prefix.to_string(), output));
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

impl PrivilegedShell for ScriptedShell {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ShellError> {
        let line = spec.command_line();
        lock(&self.calls).push(line.clone());
        let responses = lock(&self.responses);
        Ok(responses
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::failed(127, format!("{}: not found", spec.program))))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Fake device
// ============================================================================

const FAKE_APK: &[u8] = b"PK\x03\x04romtools-host-apk";
const FAKE_OWNER: &str = "10123:10123";
/// Owner of the app data directory after `pm install` assigns a fresh uid.
pub const REINSTALLED_OWNER: &str = "10456:10456";

struct DeviceState {
    root: bool,
    props: BTreeMap<String, String>,
    settings: BTreeMap<String, String>,
    battery: u8,
    free_bytes: u64,
    selinux: String,
    magisk: bool,
    /// `%u:%g` of the app data directory.
    data_owner: String,
    /// Owner recorded in the data archive when it was created.
    archived_owner: Option<String>,
    failures: Vec<(String, i32)>,
    calls: Vec<String>,
}

impl Default for DeviceState {
    fn default() -> Self {
        let props = [
            ("ro.product.model", "Pixel 7"),
            ("ro.product.manufacturer", "Google"),
            ("ro.build.version.release", "14"),
            ("ro.build.version.security_patch", "2024-05-05"),
            ("ro.product.cpu.abilist", "arm64-v8a,armeabi-v7a,armeabi"),
            ("ro.boot.flash.locked", "1"),
            ("ro.boot.verifiedbootstate", "green"),
            ("ro.boot.veritymode", "enforcing"),
            ("ro.oem_unlock_supported", "1"),
        ];
        Self {
            root: true,
            props: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            settings: [("oem_unlock_allowed".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
            battery: 90,
            free_bytes: 64 * 1024 * 1024 * 1024,
            selinux: "Enforcing".to_string(),
            magisk: false,
            data_owner: FAKE_OWNER.to_string(),
            archived_owner: None,
            failures: Vec::new(),
            calls: Vec::new(),
        }
    }
}

/// A rooted phone in a temp directory.
///
/// Reads (`getprop`, `dumpsys`, `stat`, ...) answer from scriptable state;
/// file-moving commands (`cp`, `tar`) act on the temp directory; `fastboot
/// flashing` flips the lock properties. Partitions live in a
/// [`MemoryPartitions`]. Clones share state.
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
    partitions: Arc<MemoryPartitions>,
    temp: Arc<TempDir>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevice {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {}", e));
        let device = Self {
            state: Arc::new(Mutex::new(DeviceState::default())),
            partitions: Arc::new(MemoryPartitions::new()),
            temp: Arc::new(temp),
        };
        device.seed();
        device
    }

    fn seed(&self) {
        let seeds: [(&str, Vec<u8>); 4] = [
            ("boot", b"ANDROID!boot-image-v1".repeat(64)),
            ("vbmeta", b"AVB0vbmeta".repeat(32)),
            ("recovery", b"ANDROID!recovery-v1".repeat(64)),
            ("system", vec![0x5a; 16 * 1024]),
        ];
        let layout = self.layout();
        for dir in [&layout.partition_dir, &layout.app.data_dir] {
            fs::create_dir_all(dir).unwrap_or_else(|e| panic!("{}: {}", dir.display(), e));
        }
        for (name, data) in seeds {
            let node = layout.partition_dir.join(name);
            fs::write(&node, b"").unwrap_or_else(|e| panic!("{}: {}", node.display(), e));
            self.partitions.insert(name, data);
        }
        let apk = self.installed_apk();
        if let Some(parent) = apk.parent() {
            fs::create_dir_all(parent).unwrap_or_else(|e| panic!("{}: {}", parent.display(), e));
        }
        fs::write(&apk, FAKE_APK).unwrap_or_else(|e| panic!("{}: {}", apk.display(), e));
    }

    pub fn shell(&self) -> Arc<dyn PrivilegedShell> {
        Arc::new(self.clone())
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn partitions(&self) -> Arc<MemoryPartitions> {
        Arc::clone(&self.partitions)
    }

    pub fn partition_dir(&self) -> PathBuf {
        self.root().join("dev/block/by-name")
    }

    pub fn layout(&self) -> Layout {
        let base = self.root();
        let mut layout = Layout::rooted_at(&base.join("state"));
        layout.partition_dir = self.partition_dir();
        layout.addon_d_dir = base.join("system/addon.d");
        layout.magisk_modules_dir = base.join("data/adb/modules");
        layout.magisk_marker = base.join("data/adb/magisk");
        layout.app.data_dir = base.join("data/data").join(&layout.app.package_identifier);
        layout
    }

    /// Defaults with this device's layout.
    pub fn config(&self, policy: &Policy) -> Config {
        let mut config = Config::defaults();
        config.policy = policy.clone();
        config.layout = self.layout();
        config
    }

    /// A pipeline wired to this device with an in-process run lock.
    pub fn pipeline(&self, policy: &Policy) -> OperationPipeline {
        let layout = self.layout();
        let shell = self.shell();
        let partitions: Arc<dyn PartitionStore> = self.partitions();
        let buffer = 4096;
        let parts = PipelineParts {
            probe: Arc::new(ShellCapabilityProbe::new(
                Arc::clone(&shell),
                layout.partition_dir.clone(),
            )),
            status: Arc::new(ShellStatusProvider::new(
                Arc::clone(&shell),
                policy.safety.clone(),
                layout.backup_root.clone(),
            )),
            gate: Arc::new(PolicySafetyGate::new(policy.safety.clone())),
            backups: Arc::new(FileBackupManager::new(
                layout.backup_root.clone(),
                Arc::clone(&partitions),
                buffer,
            )),
            flash: Arc::new(FlashManager::new(
                Arc::clone(&partitions),
                policy.download.clone(),
                buffer,
            )),
            bootloader: Arc::new(ShellBootloader::new(Arc::clone(&shell))),
            retention: Arc::new(ArtifactRetention::new(Arc::clone(&shell), &layout)),
            verifier: Arc::new(Verifier::new(partitions, buffer)),
        };
        OperationPipeline::new(parts, policy, RunLock::new())
    }

    /// The façade over this device.
    pub fn romtools(&self, policy: &Policy) -> RomTools {
        RomTools::new(
            self.config(policy),
            self.shell(),
            self.partitions(),
        )
        .unwrap_or_else(|e| panic!("romtools: {}", e))
    }

    pub fn apk_bytes(&self) -> Vec<u8> {
        FAKE_APK.to_vec()
    }

    fn installed_apk(&self) -> PathBuf {
        self.root().join("data/app/dev.romtools.host-1/base.apk")
    }

    // ------------------------------------------------------------------
    // State setters
    // ------------------------------------------------------------------

    pub fn set_root(&self, root: bool) {
        lock(&self.state).root = root;
    }

    pub fn set_battery(&self, percent: u8) {
        lock(&self.state).battery = percent;
    }

    pub fn set_free_bytes(&self, bytes: u64) {
        lock(&self.state).free_bytes = bytes;
    }

    pub fn set_selinux(&self, mode: &str) {
        lock(&self.state).selinux = mode.to_string();
    }

    /// `None` makes `settings get` print `null`.
    pub fn set_setting(&self, key: &str, value: Option<&str>) {
        let mut state = lock(&self.state);
        match value {
            Some(v) => state.settings.insert(key.to_string(), v.to_string()),
            None => state.settings.remove(key),
        };
    }

    pub fn set_prop(&self, name: &str, value: &str) {
        lock(&self.state)
            .props
            .insert(name.to_string(), value.to_string());
    }

    pub fn enable_addon_d(&self) {
        let dir = self.layout().addon_d_dir;
        fs::create_dir_all(&dir).unwrap_or_else(|e| panic!("{}: {}", dir.display(), e));
    }

    pub fn enable_magisk(&self) {
        let layout = self.layout();
        fs::create_dir_all(&layout.magisk_modules_dir)
            .unwrap_or_else(|e| panic!("{}: {}", layout.magisk_modules_dir.display(), e));
        lock(&self.state).magisk = true;
    }

    /// Every command line starting with `prefix` exits with `code`.
    pub fn fail_command(&self, prefix: &str, code: i32) {
        lock(&self.state).failures.push((prefix.to_string(), code));
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Current `%u:%g` of the app data directory.
    pub fn data_owner(&self) -> String {
        lock(&self.state).data_owner.clone()
    }

    /// Calls that change device state.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| is_mutating(c))
            .collect()
    }

    fn answer(&self, spec: &CommandSpec) -> CommandOutput {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        let mut state = lock(&self.state);
        match (spec.program.as_str(), args.as_slice()) {
            ("id", ["-u"]) => CommandOutput::ok(if state.root { "0\n" } else { "2000\n" }),
            ("getprop", [name]) => {
                CommandOutput::ok(format!("{}\n", state.props.get(*name).cloned().unwrap_or_default()))
            }
            ("ls", [path]) => {
                if Path::new(path).exists() {
                    CommandOutput::ok(format!("{}\n", path))
                } else {
                    CommandOutput::failed(1, format!("ls: {}: No such file or directory", path))
                }
            }
            ("cat", ["/proc/mounts"]) => CommandOutput::ok(
                "/dev/block/dm-0 / ext4 ro,seclabel,relatime 0 0\ntmpfs /dev tmpfs rw,nosuid 0 0\n",
            ),
            ("getenforce", []) => CommandOutput::ok(format!("{}\n", state.selinux)),
            ("settings", ["get", "global", key]) => CommandOutput::ok(format!(
                "{}\n",
                state.settings.get(*key).map(String::as_str).unwrap_or("null")
            )),
            ("dumpsys", ["battery"]) => CommandOutput::ok(format!(
                "Current Battery Service state:\n  AC powered: false\n  level: {}\n  scale: 100\n",
                state.battery
            )),
            ("stat", ["-f", "-c", "%a %S", _]) => {
                CommandOutput::ok(format!("{} 1\n", state.free_bytes))
            }
            ("stat", ["-c", "%u:%g", _]) => CommandOutput::ok(format!("{}\n", state.data_owner)),
            ("fastboot", ["flashing", "unlock"]) => {
                state.props.insert("ro.boot.flash.locked".into(), "0".into());
                state
                    .props
                    .insert("ro.boot.verifiedbootstate".into(), "orange".into());
                CommandOutput::ok("OKAY\n")
            }
            ("fastboot", ["flashing", "lock"]) => {
                state.props.insert("ro.boot.flash.locked".into(), "1".into());
                state
                    .props
                    .insert("ro.boot.verifiedbootstate".into(), "green".into());
                CommandOutput::ok("OKAY\n")
            }
            ("fastboot", ["boot", _]) => CommandOutput::ok("OKAY\n"),
            ("which", ["magisk"]) => {
                if state.magisk {
                    CommandOutput::ok("/sbin/magisk\n")
                } else {
                    CommandOutput::failed(1, "")
                }
            }
            ("pm", ["path", _]) => {
                CommandOutput::ok(format!("package:{}\n", self.installed_apk().display()))
            }
            ("pm", ["install", "-r", apk]) => {
                if Path::new(apk).is_file() {
                    state.data_owner = REINSTALLED_OWNER.to_string();
                    CommandOutput::ok("Success\n")
                } else {
                    CommandOutput::failed(1, "Failure [INSTALL_FAILED_INVALID_URI]")
                }
            }
            ("cp", [from, to]) => match fs::copy(from, to) {
                Ok(_) => CommandOutput::ok(""),
                Err(e) => CommandOutput::failed(1, format!("cp: {}", e)),
            },
            ("tar", ["-czf", archive, ..]) => match fs::write(archive, b"\x1f\x8bapp-data") {
                Ok(()) => {
                    state.archived_owner = Some(state.data_owner.clone());
                    CommandOutput::ok("")
                }
                Err(e) => CommandOutput::failed(2, format!("tar: {}", e)),
            },
            ("tar", ["-xzf", archive, ..]) => {
                if Path::new(archive).is_file() {
                    // Extracting as root restores the archived ownership.
                    if let Some(owner) = state.archived_owner.clone() {
                        state.data_owner = owner;
                    }
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(2, "tar: cannot open archive")
                }
            }
            ("chown", ["-R", owner, _]) => {
                state.data_owner = owner.to_string();
                CommandOutput::ok("")
            }
            ("mount", _) | ("chmod", _) | ("chown", _) | ("restorecon", _) => {
                CommandOutput::ok("")
            }
            (program, _) => CommandOutput::failed(127, format!("{}: not found", program)),
        }
    }
}

impl PrivilegedShell for FakeDevice {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ShellError> {
        let line = spec.command_line();
        let injected = {
            let mut state = lock(&self.state);
            state.calls.push(line.clone());
            state
                .failures
                .iter()
                .rev()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, code)| *code)
        };
        if let Some(code) = injected {
            return Ok(CommandOutput::failed(code, "injected failure"));
        }
        Ok(self.answer(spec))
    }

    fn name(&self) -> &str {
        "fake-device"
    }
}

fn is_mutating(command_line: &str) -> bool {
    const READ_ONLY: [&str; 10] = [
        "id ",
        "getprop ",
        "ls ",
        "cat ",
        "getenforce",
        "settings get ",
        "dumpsys ",
        "stat ",
        "which ",
        "pm path ",
    ];
    !READ_ONLY.iter().any(|p| command_line.starts_with(p))
}

// ============================================================================
// Progress capture
// ============================================================================

type Hook = Box<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Records every event. An optional hook runs on each one, which lets a
/// test change device state or cancel at a precise point.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
    hook: Option<Hook>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            hook: Some(Box::new(hook)),
        }
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        lock(&self.events).clone()
    }

    /// Operation progress values in emission order.
    pub fn percents(&self) -> Vec<f64> {
        self.events()
            .iter()
            .filter_map(|e| e.as_operation().map(|p| p.progress_percent))
            .collect()
    }

    pub fn stages(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.as_operation().map(|p| p.stage.clone()))
            .collect()
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: ProgressEvent) {
        if let Some(hook) = &self.hook {
            hook(&event);
        }
        lock(&self.events).push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_writer_replaces_contents() {
        let parts = MemoryPartitions::new();
        parts.insert("boot", b"old contents".to_vec());
        {
            let mut writer = parts.open_write("boot").unwrap();
            writer.write_all(b"new").unwrap();
        }
        assert_eq!(parts.get("boot").unwrap(), b"new");
        assert_eq!(parts.write_count(), 1);
    }

    #[test]
    fn test_corrupt_next_write_is_one_shot() {
        let parts = MemoryPartitions::new();
        parts.insert("boot", vec![0]);
        parts.corrupt_next_write("boot");
        parts.open_write("boot").unwrap().write_all(&[1, 2]).unwrap();
        assert_eq!(parts.get("boot").unwrap(), vec![0xfe, 2]);
        parts.open_write("boot").unwrap().write_all(&[1, 2]).unwrap();
        assert_eq!(parts.get("boot").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_fake_device_classifies_calls() {
        let device = FakeDevice::new();
        let shell = device.shell();
        shell.run(&CommandSpec::new("getprop", ["ro.product.model"])).unwrap();
        shell.run(&CommandSpec::new("fastboot", ["flashing", "unlock"])).unwrap();
        assert_eq!(device.calls().len(), 2);
        assert_eq!(device.mutating_calls(), vec!["fastboot flashing unlock".to_string()]);
    }

    #[test]
    fn test_scripted_shell_latest_match_wins() {
        let shell = ScriptedShell::new();
        shell.respond("getprop", CommandOutput::ok("a"));
        shell.respond("getprop ro.x", CommandOutput::ok("b"));
        let out = shell.run(&CommandSpec::new("getprop", ["ro.x"])).unwrap();
        assert_eq!(out.stdout, "b");
        let out = shell.run(&CommandSpec::new("reboot", Vec::<String>::new())).unwrap();
        assert_eq!(out.exit_code, 127);
    }
}
