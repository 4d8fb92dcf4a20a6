//! Operator control channel
//!
//! Commands arrive through a named fifo. The writer closing the fifo marks
//! the end of a command, so the proxy closes and recreates the fifo after
//! every command; an operator must reopen it for each write:
//!
//! ```text
//! printf 'add 10.0.0.5 127.0.0.1:9100' > /tmp/tcp-router.fifo
//! printf 'exit' > /tmp/tcp-router.fifo
//! ```

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd;
use tracing::debug;

use crate::error::ControlError;
use crate::routes::RouteSpec;

/// Fallback base name when argv[0] is unusable.
pub const DEFAULT_NAME: &str = "tcp-router";

/// Locations of the runtime files, derived from the program base name.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub fifo: PathBuf,
    pub lock: PathBuf,
}

impl RuntimePaths {
    /// Standard locations under /tmp.
    #[must_use]
    pub fn for_name(name: &str) -> Self {
        Self::in_dir(Path::new("/tmp"), name)
    }

    /// Locations under an arbitrary directory. Tests use this to keep
    /// instances isolated.
    #[must_use]
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self {
            fifo: dir.join(format!("{name}.fifo")),
            lock: dir.join(format!("{name}.lock")),
        }
    }
}

/// Base name of the program: the file name of argv[0] with any extension
/// stripped.
#[must_use]
pub fn base_name(argv0: &str) -> String {
    let name = Path::new(argv0)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or_default();
    if stem.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        stem.to_string()
    }
}

/// The command fifo at a fixed path.
#[derive(Debug)]
pub struct ControlChannel {
    path: PathBuf,
}

impl ControlChannel {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the fifo and open it for reading.
    ///
    /// Any stale fifo from a previous run is unlinked first. The fifo is
    /// created mode 0620 (owner read/write, group write) and opened
    /// read-only non-blocking so the open never waits for a writer.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Create` or `ControlError::Open`.
    pub fn open(&self) -> Result<File, ControlError> {
        let _ = std::fs::remove_file(&self.path);

        match unistd::mkfifo(
            &self.path,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IWGRP,
        ) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => {
                return Err(ControlError::Create {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let fifo = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| ControlError::Open {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;

        debug!("command fifo ready at {}", self.path.display());
        Ok(fifo)
    }

    /// Unlink the fifo. Called on shutdown.
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stop the event loop after the current batch.
    Exit,
    /// Add (or replace) a route at runtime.
    Add(RouteSpec),
}

impl Command {
    /// Parse one command line. The verb is case-insensitive; the caller is
    /// expected to skip empty input.
    ///
    /// # Errors
    ///
    /// `ControlError::UnknownCommand` for an unrecognised verb,
    /// `ControlError::InvalidCommand` for a bad `add` argument.
    pub fn parse(line: &str) -> Result<Self, ControlError> {
        let line = line.trim();
        if line.eq_ignore_ascii_case("exit") {
            return Ok(Self::Exit);
        }

        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));
        if verb.eq_ignore_ascii_case("add") {
            let spec = RouteSpec::parse(rest)
                .map_err(|e| ControlError::InvalidCommand(line.to_string(), e.to_string()))?;
            return Ok(Self::Add(spec));
        }

        Err(ControlError::UnknownCommand(line.to_string()))
    }
}
