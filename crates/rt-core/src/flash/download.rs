//! Resumable downloads.
//!
//! `<dest>.part` holds confirmed bytes and `<dest>.part.json` the
//! [`Checkpoint`]. On resume the trailing window before the confirmed offset
//! is re-read from both the source and the partial file, and both must hash
//! to the recorded value; otherwise the partial file is discarded.
//!
//! An exclusive `flock` on `<dest>.part.lock` keeps two downloads from
//! sharing one partial file.

use super::image::normalize_sha256;
use super::{FlashError, ImageSource};
use crate::cancel::CancellationToken;
use crate::events::{ProgressEvent, ProgressSink};
use crate::logging::event_names;
use crate::partition::{hash_file, hash_reader};
use crate::pipeline::{LockError, RunLock};
use rt_common::DownloadProgress;
use rt_config::DownloadPolicy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Bytes confirmed on disk.
    pub offset: u64,
    pub total: Option<u64>,
    /// SHA-256 of the `window_len` bytes ending at `offset`.
    pub window_sha256: String,
    pub window_len: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadReport {
    pub dest: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    pub resumed_from: u64,
    pub elapsed_ms: u64,
}

pub(crate) fn part_path(dest: &Path) -> PathBuf {
    append_ext(dest, "part")
}

pub(crate) fn checkpoint_path(dest: &Path) -> PathBuf {
    append_ext(dest, "part.json")
}

pub(crate) fn lock_path(dest: &Path) -> PathBuf {
    append_ext(dest, "part.lock")
}

fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

impl Checkpoint {
    fn load(path: &Path) -> Option<Self> {
        let json = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&json) {
            Ok(cp) => Some(cp),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint");
                None
            }
        }
    }

    fn store(&self, path: &Path) -> Result<(), FlashError> {
        let tmp = append_ext(path, "tmp");
        fs::write(&tmp, serde_json::to_vec(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Trailing bytes of the confirmed prefix.
struct Window {
    bytes: Vec<u8>,
    cap: usize,
}

impl Window {
    fn new(cap: u64) -> Self {
        Self {
            bytes: Vec::new(),
            cap: cap as usize,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.cap {
            let excess = self.bytes.len() - self.cap;
            self.bytes.drain(..excess);
        }
    }

    fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }
}

fn discard(part: &Path, checkpoint: &Path) {
    let _ = fs::remove_file(part);
    let _ = fs::remove_file(checkpoint);
}

/// Decide the resume offset, verifying the trailing window against the
/// source. Returns the offset and the window primed from the partial file.
fn resume_point(
    source: &dyn ImageSource,
    part: &Path,
    checkpoint_file: &Path,
    total: Option<u64>,
    policy: &DownloadPolicy,
) -> Result<(u64, Window), FlashError> {
    let fresh = || Window::new(policy.resume_window_bytes);
    let Some(cp) = Checkpoint::load(checkpoint_file) else {
        discard(part, checkpoint_file);
        return Ok((0, fresh()));
    };
    let part_len = fs::metadata(part).map(|m| m.len()).unwrap_or(0);
    let consistent = cp.offset > 0
        && part_len >= cp.offset
        && cp.window_len <= cp.offset
        && (cp.total.is_none() || cp.total == total)
        && total.map_or(true, |t| cp.offset <= t);
    if !consistent {
        debug!(offset = cp.offset, part_len, "checkpoint not usable, starting over");
        discard(part, checkpoint_file);
        return Ok((0, fresh()));
    }

    let window_start = cp.offset - cp.window_len;
    let reader = source.open_at(window_start)?;
    let (read, source_sha) = hash_reader(reader, Some(cp.window_len), 64 * 1024)?;
    if read != cp.window_len || source_sha != cp.window_sha256 {
        warn!(
            source = %source.describe(),
            offset = cp.offset,
            "trailing window no longer matches the source, discarding partial download"
        );
        discard(part, checkpoint_file);
        return Err(FlashError::ChecksumMismatch {
            subject: format!("{} bytes {}..{}", source.describe(), window_start, cp.offset),
            expected: cp.window_sha256,
            actual: source_sha,
        });
    }

    let mut file = OpenOptions::new().read(true).write(true).open(part)?;
    file.set_len(cp.offset)?;
    file.seek(SeekFrom::Start(window_start))?;
    let mut local = Vec::with_capacity(cp.window_len as usize);
    (&mut file).take(cp.window_len).read_to_end(&mut local)?;
    let local_sha = hex::encode(Sha256::digest(&local));
    if local_sha != cp.window_sha256 {
        warn!(
            part = %part.display(),
            offset = cp.offset,
            "partial download is corrupted before the resume point, discarding it"
        );
        drop(file);
        discard(part, checkpoint_file);
        return Err(FlashError::ChecksumMismatch {
            subject: format!("{} bytes {}..{}", part.display(), window_start, cp.offset),
            expected: cp.window_sha256,
            actual: local_sha,
        });
    }

    let mut window = fresh();
    window.push(&local);
    Ok((cp.offset, window))
}

pub(crate) fn run(
    source: &dyn ImageSource,
    dest: &Path,
    expected_sha256: Option<&str>,
    policy: &DownloadPolicy,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<DownloadReport, FlashError> {
    let expected = expected_sha256
        .map(|s| {
            normalize_sha256(s)
                .ok_or_else(|| FlashError::InvalidImage(format!("{:?} is not a SHA-256 hex digest", s)))
        })
        .transpose()?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let part = part_path(dest);
    let checkpoint_file = checkpoint_path(dest);
    let _guard = RunLock::with_file(lock_path(dest))
        .try_acquire()
        .map_err(|e| match e {
            LockError::Held => FlashError::DownloadBusy {
                dest: dest.to_path_buf(),
            },
            LockError::Io { source, .. } => FlashError::Io(source),
        })?;
    let total = source.total_len()?;

    let (resumed_from, mut window) =
        resume_point(source, &part, &checkpoint_file, total, policy)?;
    if resumed_from > 0 {
        info!(
            target: event_names::DOWNLOAD_RESUMED,
            source = %source.describe(),
            offset = resumed_from,
            "resuming download"
        );
    }

    let mut file = OpenOptions::new().create(true).append(true).open(&part)?;
    let mut reader = source.open_at(resumed_from)?;
    let mut buf = vec![0u8; policy.chunk_size_bytes.max(1)];
    let mut offset = resumed_from;
    let started = Instant::now();

    let progress = |offset: u64, done: bool| {
        let secs = started.elapsed().as_secs_f64();
        let rate = if secs > 0.0 {
            (offset - resumed_from) as f64 / secs
        } else {
            0.0
        };
        sink.emit(ProgressEvent::download(DownloadProgress {
            bytes_downloaded: offset,
            total_bytes: total,
            bytes_per_second: rate,
            is_completed: done,
            resumed_from,
        }));
    };

    loop {
        if cancel.is_cancelled() {
            info!(offset, "download cancelled");
            return Err(FlashError::Cancelled { bytes: offset });
        }
        let n = match read_chunk(&mut reader, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(offset, error = %e, "download interrupted");
                return Err(FlashError::Source(e.to_string()));
            }
        };
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        file.sync_data()?;
        offset += n as u64;
        window.push(&buf[..n]);
        Checkpoint {
            offset,
            total,
            window_sha256: window.digest(),
            window_len: window.bytes.len() as u64,
        }
        .store(&checkpoint_file)?;
        progress(offset, false);
    }
    drop(file);

    if let Some(total) = total {
        if offset != total {
            return Err(FlashError::Source(format!(
                "source ended after {} of {} bytes",
                offset, total
            )));
        }
    }

    let (_, sha256) = hash_file(&part, 64 * 1024)?;
    if let Some(expected) = expected {
        if expected != sha256 {
            discard(&part, &checkpoint_file);
            return Err(FlashError::ChecksumMismatch {
                subject: dest.display().to_string(),
                expected,
                actual: sha256,
            });
        }
    }
    fs::rename(&part, dest)?;
    let _ = fs::remove_file(&checkpoint_file);
    progress(offset, true);
    info!(
        target: event_names::DOWNLOAD_FINISHED,
        dest = %dest.display(),
        bytes = offset,
        resumed_from,
        "download finished"
    );

    Ok(DownloadReport {
        dest: dest.to_path_buf(),
        bytes: offset,
        sha256,
        resumed_from,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Fill as much of `buf` as one chunk allows, retrying interrupted reads.
fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if filled > 0 {
                    break;
                }
                return Err(e);
            }
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::flash::FileSource;

    fn policy(chunk: usize, window: u64) -> DownloadPolicy {
        DownloadPolicy {
            chunk_size_bytes: chunk,
            resume_window_bytes: window,
            ..DownloadPolicy::default()
        }
    }

    #[test]
    fn test_paths() {
        let dest = Path::new("/d/rom.zip");
        assert_eq!(part_path(dest), Path::new("/d/rom.zip.part"));
        assert_eq!(checkpoint_path(dest), Path::new("/d/rom.zip.part.json"));
    }

    #[test]
    fn test_window_keeps_tail() {
        let mut w = Window::new(4);
        w.push(b"abc");
        w.push(b"defg");
        assert_eq!(w.bytes, b"defg");
    }

    #[test]
    fn test_fresh_download() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 199) as u8).collect();
        fs::write(&src, &data).unwrap();
        let dest = temp.path().join("out/rom.bin");

        let report = run(
            &FileSource::new(&src),
            &dest,
            None,
            &policy(8192, 1024),
            &NullSink,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(report.bytes, 50_000);
        assert_eq!(report.resumed_from, 0);
        assert_eq!(fs::read(&dest).unwrap(), data);
        assert!(!part_path(&dest).exists());
        assert!(!checkpoint_path(&dest).exists());
    }

    #[test]
    fn test_expected_digest_mismatch_discards() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src.bin");
        fs::write(&src, b"hello").unwrap();
        let dest = temp.path().join("rom.bin");
        let err = run(
            &FileSource::new(&src),
            &dest,
            Some(&"0".repeat(64)),
            &policy(2, 2),
            &NullSink,
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, FlashError::ChecksumMismatch { .. }));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_concurrent_download_to_same_dest_is_refused() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src.bin");
        fs::write(&src, b"payload").unwrap();
        let dest = temp.path().join("rom.bin");
        let held = RunLock::with_file(lock_path(&dest)).try_acquire().unwrap();

        let err = run(
            &FileSource::new(&src),
            &dest,
            None,
            &policy(4, 4),
            &NullSink,
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, FlashError::DownloadBusy { .. }));
        assert!(!part_path(&dest).exists());
        assert!(matches!(
            rt_common::Error::from(err),
            rt_common::Error::ConcurrentOperation
        ));

        drop(held);
        let report = run(
            &FileSource::new(&src),
            &dest,
            None,
            &policy(4, 4),
            &NullSink,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(report.bytes, 7);
    }

    #[test]
    fn test_stale_partial_without_checkpoint_is_replaced() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src.bin");
        fs::write(&src, b"fresh bytes").unwrap();
        let dest = temp.path().join("rom.bin");
        fs::write(part_path(&dest), b"garbage garbage garbage").unwrap();

        let report = run(
            &FileSource::new(&src),
            &dest,
            None,
            &policy(4, 4),
            &NullSink,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(report.resumed_from, 0);
        assert_eq!(fs::read(&dest).unwrap(), b"fresh bytes");
    }
}
