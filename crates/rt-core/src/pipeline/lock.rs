//! The width-1 run lock.
//!
//! An in-process flag guarantees one pipeline run per [`RunLock`]; an
//! optional advisory `flock` on a lock file extends that to other processes.
//! Both are released when the [`RunGuard`] drops.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another device operation is already running")]
    Held,

    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RunLock {
    held: Arc<AtomicBool>,
    path: Option<PathBuf>,
}

impl RunLock {
    /// In-process lock only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also take an exclusive `flock` on `path` for the duration of a run.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            path: Some(path.into()),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Try to take the lock without waiting.
    pub fn try_acquire(&self) -> Result<RunGuard, LockError> {
        if self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LockError::Held);
        }
        let file = match &self.path {
            Some(path) => match FileLock::acquire(path) {
                Ok(lock) => Some(lock),
                Err(e) => {
                    self.held.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            },
            None => None,
        };
        Ok(RunGuard {
            held: Arc::clone(&self.held),
            _file: file,
        })
    }
}

/// Releases the run lock on drop, on every exit path.
#[derive(Debug)]
pub struct RunGuard {
    held: Arc<AtomicBool>,
    _file: Option<FileLock>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if result != 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Err(LockError::Held);
                }
                return Err(io_err(err));
            }
        }

        file.set_len(0).map_err(io_err)?;
        let mut writer = &file;
        let _ = writer.write_all(std::process::id().to_string().as_bytes());
        let _ = writer.flush();
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        // The file stays; deleting it would let two processes lock different inodes.
    }
}
