//! Single-instance guard
//!
//! An advisory fcntl write lock over the whole lock file. The lock is held
//! implicitly for the process lifetime and released by the kernel when the
//! file closes, so dropping the guard is enough; [`InstanceLock::remove`]
//! additionally unlinks the file on a clean shutdown.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::TcpRouterError;

/// Holds the advisory lock for the lifetime of the process.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    // None when the guard degraded to unlocked mode (see acquire).
    file: Option<File>,
}

impl InstanceLock {
    /// Take the instance lock.
    ///
    /// EACCES or EAGAIN from F_SETLK means another instance holds the lock
    /// and startup must be refused. Any other open or lock failure is
    /// treated as "no instance running": the guard degrades to unlocked
    /// mode with a warning and the process proceeds.
    ///
    /// # Errors
    ///
    /// Returns `TcpRouterError::AlreadyRunning` when the lock is held
    /// elsewhere.
    pub fn acquire(path: impl AsRef<Path>, name: &str) -> Result<Self, TcpRouterError> {
        let path = path.as_ref().to_path_buf();

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    "cannot open lock file {}: {e}; continuing without instance guard",
                    path.display()
                );
                return Ok(Self { path, file: None });
            }
        };

        let mut lock: libc::flock = unsafe { mem::zeroed() };
        lock.l_type = libc::F_WRLCK as libc::c_short;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        // l_start and l_len stay zero: lock the whole file.

        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EACCES | libc::EAGAIN) => {
                    return Err(TcpRouterError::AlreadyRunning {
                        name: name.to_string(),
                    });
                }
                _ => {
                    warn!(
                        "cannot lock {}: {err}; continuing without instance guard",
                        path.display()
                    );
                }
            }
        }

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Whether the advisory lock is actually held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    /// Unlink the lock file. Called on clean shutdown; the lock itself is
    /// released when the guard drops.
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
