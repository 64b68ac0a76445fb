//! Registry of configured application servers.
//!
//! Records are added once while the configuration is loaded and looked up on
//! every request afterwards. The registry never deduplicates: a second record
//! for the same path shadows the earlier one, because lookups visit the most
//! recently inserted record first.

mod record;

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

pub use record::{AppClass, ServerRecord, UNBOUND_LISTEN_FD};
use thiserror::Error;
use tracing::debug;

use crate::access::{AccessChecker, AccessError, AccessMode, FileStatus};

/// File name prefix of "no parsed headers" scripts.
pub const NPH_PREFIX: &[u8] = b"nph-";

/// Ordered collection of server records, newest first on lookup.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    records: Vec<ServerRecord>,
    privilege_separation: bool,
}

impl ServerRegistry {
    /// An empty registry. With `privilege_separation` on, lookups also match
    /// the record's credentials.
    #[must_use]
    pub const fn new(privilege_separation: bool) -> Self {
        Self {
            records: Vec::new(),
            privilege_separation,
        }
    }

    /// Whether lookups compare credentials.
    #[must_use]
    pub const fn privilege_separation(&self) -> bool {
        self.privilege_separation
    }

    /// Add a record. It takes precedence over every earlier record.
    pub fn insert(&mut self, record: ServerRecord) {
        debug!(
            path = %record.fs_path.display(),
            user = record.user().unwrap_or(""),
            class = ?record.class,
            "registering application server"
        );
        self.records.push(record);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records, most recently inserted first.
    pub fn iter(&self) -> impl Iterator<Item = &ServerRecord> {
        self.records.iter().rev()
    }

    /// Mutable records, most recently inserted first.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerRecord> {
        self.records.iter_mut().rev()
    }

    /// First record for `path` and, under privilege separation, the exact
    /// `uid`/`gid`.
    ///
    /// Under privilege separation a record without an assigned identity
    /// never matches, not even uid 0/gid 0.
    #[must_use]
    pub fn find_by_identity(
        &self,
        path: impl AsRef<Path>,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Option<&ServerRecord> {
        let path = path.as_ref();
        self.iter().find(|record| {
            record.fs_path == path
                && (!self.privilege_separation
                    || (record.uid() == Some(uid) && record.gid() == Some(gid)))
        })
    }

    /// First record for `path` and, under privilege separation, the given
    /// user and group names.
    ///
    /// A user name starting with `~` (a per-user directory application) is
    /// matched on the user alone.
    #[must_use]
    pub fn find_by_names(
        &self,
        path: impl AsRef<Path>,
        user: &str,
        group: &str,
    ) -> Option<&ServerRecord> {
        let path = path.as_ref();
        self.iter().find(|record| {
            if record.fs_path != path {
                return false;
            }
            if !self.privilege_separation {
                return true;
            }
            record.user() == Some(user) && (user.starts_with('~') || record.group() == Some(group))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Path Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Which identity an execute check was performed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckedIdentity {
    /// The per-application suexec identity.
    Suexec,
    /// The gateway's own run-as identity.
    Server,
}

impl std::fmt::Display for CheckedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Suexec => write!(f, "suexec"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Why a path cannot be run as an application.
#[derive(Debug, Error)]
pub enum PathValidationError {
    /// The path could not be stat'ed.
    #[error("stat() failed: {source}")]
    StatFailed {
        /// Path that was stat'ed.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The file name marks a no-parsed-headers script.
    #[error("NPH scripts cannot be run as FastCGI applications")]
    NphScript,

    /// The status snapshot describes a missing file.
    #[error("script not found or unable to stat()")]
    NotFound,

    /// The path is a directory.
    #[error("script is a directory")]
    IsDirectory,

    /// The identity may not execute the file.
    #[error("access for {identity} (uid {uid}, gid {gid}) not allowed: {source}")]
    AccessDenied {
        /// Whose permissions were checked.
        identity: CheckedIdentity,
        /// Uid checked.
        uid: libc::uid_t,
        /// Gid checked.
        gid: libc::gid_t,
        /// The checker's verdict.
        #[source]
        source: AccessError,
    },
}

/// Decide whether `path` may be run as an application by `uid`/`gid`.
///
/// `status` is stat'ed from `path` when not supplied.
///
/// # Errors
///
/// Returns the first [`PathValidationError`] that applies.
pub fn validate_path(
    checker: &AccessChecker<'_>,
    path: &Path,
    status: Option<&FileStatus>,
    identity: CheckedIdentity,
    uid: libc::uid_t,
    gid: libc::gid_t,
) -> Result<(), PathValidationError> {
    if is_nph_script(path) {
        return Err(PathValidationError::NphScript);
    }

    let stat;
    let status = if let Some(status) = status {
        status
    } else {
        stat = FileStatus::stat(path).map_err(|source| PathValidationError::StatFailed {
            path: path.to_path_buf(),
            source,
        })?;
        &stat
    };

    if !status.exists() {
        return Err(PathValidationError::NotFound);
    }
    if status.is_dir() {
        return Err(PathValidationError::IsDirectory);
    }

    checker
        .check(path, Some(status), AccessMode::X_OK, uid, gid)
        .map_err(|source| PathValidationError::AccessDenied {
            identity,
            uid,
            gid,
            source,
        })
}

fn is_nph_script(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.as_bytes().starts_with(NPH_PREFIX))
}
