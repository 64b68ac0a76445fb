//! Lock-file guard for dynamic socket creation.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use super::lock_file_name;
use crate::lock::{self, LockError};

/// Errors acquiring a [`SocketLock`].
#[derive(Debug, Error)]
pub enum SocketLockError {
    /// The lock file could not be opened or created.
    #[error("failed to open lock file {}: {source}", path.display())]
    Open {
        /// Lock file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The lock request failed.
    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying lock error.
        #[source]
        source: LockError,
    },
}

/// Lock files claimed by a live [`SocketLock`] in this process.
///
/// `fcntl` locks belong to the process: a second descriptor on a file this
/// process already locks is granted the lock, and closing or unlocking it
/// releases the first holder's lock too. Claims keep each lock file to at
/// most one guard per process.
static CLAIMED: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());
static RELEASED: Condvar = Condvar::new();

fn claimed() -> MutexGuard<'static, BTreeSet<PathBuf>> {
    CLAIMED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local claim on one lock file, released on drop.
#[derive(Debug)]
struct Claim {
    key: PathBuf,
}

impl Claim {
    fn wait(key: PathBuf) -> Self {
        let mut held = claimed();
        while held.contains(&key) {
            held = RELEASED.wait(held).unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key.clone());
        Self { key }
    }

    fn try_take(key: PathBuf) -> Option<Self> {
        if claimed().insert(key.clone()) {
            Some(Self { key })
        } else {
            None
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        claimed().remove(&self.key);
        RELEASED.notify_all();
    }
}

/// Exclusive advisory lock on `<socket>.lock`, held until dropped.
///
/// Exclusion holds between processes and between guards within one process.
/// A thread that already holds the guard for a socket must not call
/// [`SocketLock::acquire`] for it again: that waits for itself forever.
/// Descriptors on the lock file opened outside this type are not tracked,
/// and closing one drops this process's lock.
#[derive(Debug)]
pub struct SocketLock {
    // Field order matters: the descriptor is closed before the claim is
    // released.
    file: File,
    path: PathBuf,
    _claim: Claim,
}

impl SocketLock {
    /// Wait for the exclusive lock guarding `socket_path`, creating the lock
    /// file (mode 0600) if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SocketLockError`] if the lock file cannot be opened or the
    /// lock request fails for a reason other than signal interruption.
    pub fn acquire(socket_path: &Path) -> Result<Self, SocketLockError> {
        let path = lock_file_name(socket_path);
        let claim = Claim::wait(claim_key(&path)?);
        let file = open_lock_file(&path)?;
        lock::write_lock_wait(&file).map_err(|source| SocketLockError::Lock {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "socket lock acquired");
        Ok(Self {
            file,
            path,
            _claim: claim,
        })
    }

    /// Take the lock only if neither another process nor another guard in
    /// this process holds it.
    ///
    /// Returns `Ok(None)` when the lock is contended.
    ///
    /// # Errors
    ///
    /// As for [`Self::acquire`], except that contention is not an error.
    pub fn try_acquire(socket_path: &Path) -> Result<Option<Self>, SocketLockError> {
        let path = lock_file_name(socket_path);
        let Some(claim) = Claim::try_take(claim_key(&path)?) else {
            debug!(path = %path.display(), "socket lock held in this process");
            return Ok(None);
        };
        let file = open_lock_file(&path)?;
        let acquired = lock::try_write_lock(&file).map_err(|source| SocketLockError::Lock {
            path: path.clone(),
            source,
        })?;
        if !acquired {
            debug!(path = %path.display(), "socket lock held by another process");
            return Ok(None);
        }
        Ok(Some(Self {
            file,
            path,
            _claim: claim,
        }))
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketLock {
    fn drop(&mut self) {
        if let Err(err) = lock::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release socket lock");
        }
    }
}

/// Claim key for a lock file: its canonical directory plus file name, so
/// different spellings of one path share a claim.
fn claim_key(lock_path: &Path) -> Result<PathBuf, SocketLockError> {
    let dir = match lock_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let dir = dir.canonicalize().map_err(|source| SocketLockError::Open {
        path: lock_path.to_path_buf(),
        source,
    })?;
    Ok(match lock_path.file_name() {
        Some(name) => dir.join(name),
        None => dir,
    })
}

fn open_lock_file(path: &Path) -> Result<File, SocketLockError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)
        .map_err(|source| SocketLockError::Open {
            path: path.to_path_buf(),
            source,
        })
}
