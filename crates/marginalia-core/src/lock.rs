//! Single-writer advisory lock for a review session's data directory.
//!
//! The outbox and mirror are single-writer stores. Two `mg` processes opening
//! the same session would interleave dispatches and break FIFO delivery, so
//! the engine holds an exclusive `fs2` lock for its whole lifetime.

use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Advisory lock errors for the session lock file.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{}: session lock timed out after {waited:?} at {}", ErrorCode::LockContention.code(), .path.display())]
    Timeout { path: PathBuf, waited: Duration },

    #[error("{}: {0}", ErrorCode::StorageFailure.code())]
    IoError(#[from] io::Error),
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::IoError(_) => ErrorCode::StorageFailure,
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Held for the lifetime of a session; dropping it unlocks.
#[derive(Debug)]
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

const RETRY_EVERY: Duration = Duration::from_millis(10);

impl SessionLock {
    /// Take the exclusive lock on `path`, retrying until `timeout` passes.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] while another session keeps the lock,
    /// [`LockError::IoError`] if the lock file cannot be opened.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        while file.try_lock_exclusive().is_err() {
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: timeout,
                });
            }
            thread::sleep(RETRY_EVERY.min(deadline - now));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn release(self) {
        drop(self);
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::debug!(%err, path = %self.path.display(), "session lock release failed");
        }
    }
}
