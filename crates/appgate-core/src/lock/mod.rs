//! Advisory byte-range locking.
//!
//! Thin wrapper around `fcntl(2)` record locks, used to serialize creation of
//! dynamic sockets through their `<socket>.lock` files. Locks are advisory:
//! only cooperating processes that take them are excluded.
//!
//! # Interruption
//!
//! A blocking `F_SETLKW` may return `EINTR` when a signal arrives. That is not
//! a lock failure: [`lock_region`] retries until the call completes or fails
//! for another reason. This is the only place in the crate that swallows an
//! error. Callers needing a bounded wait must arrange for their own deadline
//! (for example an alarm that the supervisor turns into a hard failure).

use std::io;
use std::os::fd::{AsFd, AsRawFd};

use thiserror::Error;
use tracing::debug;

/// Blocking behaviour of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCommand {
    /// `F_SETLK`: fail immediately if the region is held by another process.
    Set,
    /// `F_SETLKW`: wait until the region becomes available.
    SetWait,
}

impl LockCommand {
    const fn as_raw(self) -> libc::c_int {
        match self {
            Self::Set => libc::F_SETLK,
            Self::SetWait => libc::F_SETLKW,
        }
    }
}

/// Kind of lock to place on the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// Shared lock (`F_RDLCK`).
    Read,
    /// Exclusive lock (`F_WRLCK`).
    Write,
    /// Release (`F_UNLCK`).
    Unlock,
}

impl LockType {
    #[allow(clippy::cast_possible_truncation)]
    const fn as_raw(self) -> libc::c_short {
        (match self {
            Self::Read => libc::F_RDLCK,
            Self::Write => libc::F_WRLCK,
            Self::Unlock => libc::F_UNLCK,
        }) as libc::c_short
    }
}

/// Origin that the region offset is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// `SEEK_SET`
    Start,
    /// `SEEK_CUR`
    Current,
    /// `SEEK_END`
    End,
}

impl Whence {
    #[allow(clippy::cast_possible_truncation)]
    const fn as_raw(self) -> libc::c_short {
        (match self {
            Self::Start => libc::SEEK_SET,
            Self::Current => libc::SEEK_CUR,
            Self::End => libc::SEEK_END,
        }) as libc::c_short
    }
}

/// Error returned by the locking wrappers.
#[derive(Debug, Error)]
pub enum LockError {
    /// `fcntl` failed with something other than `EINTR`.
    #[error("fcntl lock request failed: {source}")]
    Failed {
        /// Underlying OS error, unchanged.
        #[source]
        source: io::Error,
    },
}

impl LockError {
    /// Whether the failure means another process holds a conflicting lock
    /// (only reported by non-waiting requests).
    #[must_use]
    pub fn is_contended(&self) -> bool {
        let Self::Failed { source } = self;
        matches!(
            source.raw_os_error(),
            Some(libc::EAGAIN | libc::EACCES)
        )
    }
}

/// Run `op` until it returns something other than an `EINTR` failure.
pub(crate) fn retry_on_interrupt<T, F>(mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut interrupts = 0u32;
    loop {
        match op() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                interrupts = interrupts.saturating_add(1);
                debug!(interrupts, "lock request interrupted by signal, retrying");
            },
            other => return other,
        }
    }
}

/// Apply or release an advisory lock on `len` bytes starting at `offset`
/// (relative to `whence`). A `len` of zero extends the region to end of file.
///
/// # Errors
///
/// Returns [`LockError::Failed`] carrying the OS error for any failure other
/// than signal interruption, which is retried transparently.
pub fn lock_region<Fd: AsFd>(
    fd: Fd,
    command: LockCommand,
    lock_type: LockType,
    offset: libc::off_t,
    whence: Whence,
    len: libc::off_t,
) -> Result<(), LockError> {
    let raw_fd = fd.as_fd().as_raw_fd();

    // SAFETY: `flock` is a plain C struct; all-zero is a valid value and
    // covers platform-specific padding fields.
    #[allow(unsafe_code)]
    let mut request: libc::flock = unsafe { std::mem::zeroed() };
    request.l_type = lock_type.as_raw();
    request.l_whence = whence.as_raw();
    request.l_start = offset;
    request.l_len = len;

    retry_on_interrupt(|| {
        // SAFETY: `raw_fd` is borrowed from a live `AsFd` for the duration of
        // this call and `request` is a valid, initialized `flock`.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::fcntl(raw_fd, command.as_raw(), &request) };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    })
    .map_err(|source| LockError::Failed { source })
}

/// Wait for a shared lock on the whole file.
///
/// # Errors
///
/// See [`lock_region`].
pub fn read_lock_wait<Fd: AsFd>(fd: Fd) -> Result<(), LockError> {
    lock_region(fd, LockCommand::SetWait, LockType::Read, 0, Whence::Start, 0)
}

/// Wait for an exclusive lock on the whole file.
///
/// # Errors
///
/// See [`lock_region`].
pub fn write_lock_wait<Fd: AsFd>(fd: Fd) -> Result<(), LockError> {
    lock_region(fd, LockCommand::SetWait, LockType::Write, 0, Whence::Start, 0)
}

/// Try to take an exclusive lock on the whole file without waiting.
///
/// Returns `Ok(false)` when another process holds a conflicting lock.
///
/// # Errors
///
/// Any failure other than contention.
pub fn try_write_lock<Fd: AsFd>(fd: Fd) -> Result<bool, LockError> {
    match lock_region(fd, LockCommand::Set, LockType::Write, 0, Whence::Start, 0) {
        Ok(()) => Ok(true),
        Err(err) if err.is_contended() => Ok(false),
        Err(err) => Err(err),
    }
}

/// Release any lock this process holds on the whole file.
///
/// # Errors
///
/// See [`lock_region`].
pub fn unlock<Fd: AsFd>(fd: Fd) -> Result<(), LockError> {
    lock_region(fd, LockCommand::Set, LockType::Unlock, 0, Whence::Start, 0)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    /// `lock_region` issues its `fcntl` call through `retry_on_interrupt`, so
    /// a lock request interrupted many times looks like one uninterrupted
    /// call to the caller.
    #[test]
    fn lock_region_retry_hides_repeated_interrupts() {
        let calls = Cell::new(0);
        let result = retry_on_interrupt(|| {
            calls.set(calls.get() + 1);
            if calls.get() <= 50 {
                Err(io::Error::from_raw_os_error(libc::EINTR))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 51);
    }

    #[test]
    fn retry_surfaces_other_errors_unchanged() {
        let calls = Cell::new(0);
        let result: io::Result<()> = retry_on_interrupt(|| {
            calls.set(calls.get() + 1);
            Err(io::Error::from_raw_os_error(libc::EBADF))
        });
        assert_eq!(result.unwrap_err().raw_os_error(), Some(libc::EBADF));
        assert_eq!(calls.get(), 1, "non-EINTR failures are not retried");
    }

    #[cfg_attr(miri, ignore)] // Miri can't call fcntl
    #[test]
    fn lock_and_unlock_regular_file() {
        let file = tempfile::tempfile().unwrap();
        write_lock_wait(&file).unwrap();
        unlock(&file).unwrap();
        read_lock_wait(&file).unwrap();
        unlock(&file).unwrap();
        assert!(try_write_lock(&file).unwrap());
        unlock(&file).unwrap();
    }

    #[cfg_attr(miri, ignore)] // Miri can't call fcntl
    #[test]
    fn partial_region_lock() {
        let file = tempfile::tempfile().unwrap();
        lock_region(&file, LockCommand::Set, LockType::Write, 16, Whence::Start, 32).unwrap();
        lock_region(&file, LockCommand::Set, LockType::Unlock, 16, Whence::Start, 32).unwrap();
    }

    #[cfg_attr(miri, ignore)] // Miri can't call fcntl
    #[test]
    fn write_lock_on_read_only_descriptor_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.lock");
        std::fs::write(&path, b"").unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let err = write_lock_wait(&file).unwrap_err();
        assert!(!err.is_contended());
        let LockError::Failed { source } = &err;
        assert_eq!(source.raw_os_error(), Some(libc::EBADF));
        assert!(err.to_string().contains("fcntl lock request failed"));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[test]
    fn try_write_lock_reports_lock_held_by_other_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.lock");
        let holder = test_support::ChildLock::hold(&path);

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        assert!(!try_write_lock(&file).unwrap());
        let err = lock_region(&file, LockCommand::Set, LockType::Read, 0, Whence::Start, 0)
            .unwrap_err();
        assert!(err.is_contended(), "{err}");

        drop(holder);
        assert!(try_write_lock(&file).unwrap());
        unlock(&file).unwrap();
    }

    #[test]
    fn contention_classification() {
        let err = LockError::Failed {
            source: io::Error::from_raw_os_error(libc::EAGAIN),
        };
        assert!(err.is_contended());
        let err = LockError::Failed {
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        assert!(err.is_contended());
    }
}

/// Lock holders in a separate process.
///
/// `fcntl` locks never conflict within one process, so contention can only
/// be observed from another one. The test binary re-runs itself with
/// [`child_lock_entry`](test_support::child_lock_entry) selected and the
/// request passed through the environment.
#[cfg(test)]
pub(crate) mod test_support {
    use std::fs::OpenOptions;
    use std::io::{self, BufRead, BufReader, Read, Write};
    use std::path::Path;
    use std::process::{Child, Command, Stdio};

    use super::{try_write_lock, write_lock_wait};

    const MODE_ENV: &str = "APPGATE_LOCK_CHILD_MODE";
    const PATH_ENV: &str = "APPGATE_LOCK_CHILD_PATH";
    const ENTRY: &str = "lock::test_support::child_lock_entry";
    const REPORT_PREFIX: &str = "lock-child: ";

    /// A child process holding a write lock on a file until dropped.
    pub(crate) struct ChildLock {
        child: Child,
    }

    impl ChildLock {
        /// Start a child that write-locks `path` and wait until it holds the
        /// lock.
        pub(crate) fn hold(path: &Path) -> Self {
            let mut child = spawn(path, "hold");
            assert_eq!(read_report(&mut child), "locked");
            Self { child }
        }
    }

    impl Drop for ChildLock {
        fn drop(&mut self) {
            // Closing stdin lets the child exit, which releases its lock.
            drop(self.child.stdin.take());
            let _ = self.child.wait();
        }
    }

    /// Whether another process could take a write lock on `path` right now.
    pub(crate) fn free_for_other_process(path: &Path) -> bool {
        let mut child = spawn(path, "check");
        let report = read_report(&mut child);
        drop(child.stdin.take());
        let _ = child.wait();
        match report.as_str() {
            "free" => true,
            "held" => false,
            other => panic!("unexpected child report {other:?}"),
        }
    }

    fn spawn(path: &Path, mode: &str) -> Child {
        Command::new(std::env::current_exe().unwrap())
            .args([ENTRY, "--exact", "--ignored", "--nocapture", "--test-threads=1", "-q"])
            .env(MODE_ENV, mode)
            .env(PATH_ENV, path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn read_report(child: &mut Child) -> String {
        let stdout = child.stdout.take().unwrap();
        for line in BufReader::new(stdout).lines() {
            let line = line.unwrap();
            if let Some(report) = line.strip_prefix(REPORT_PREFIX) {
                return report.to_string();
            }
        }
        panic!("lock child exited without reporting");
    }

    #[test]
    #[ignore = "entry point for lock tests that need a second process"]
    fn child_lock_entry() {
        let (Ok(mode), Some(path)) = (std::env::var(MODE_ENV), std::env::var_os(PATH_ENV)) else {
            return;
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap();
        let report = match mode.as_str() {
            "hold" => {
                write_lock_wait(&file).unwrap();
                "locked"
            },
            "check" => {
                if try_write_lock(&file).unwrap() {
                    "free"
                } else {
                    "held"
                }
            },
            other => panic!("unknown lock child mode {other:?}"),
        };
        println!("{REPORT_PREFIX}{report}");
        io::stdout().flush().unwrap();

        // Hold until the parent closes our stdin.
        let _ = io::stdin().read_to_end(&mut Vec::new());
    }
}
