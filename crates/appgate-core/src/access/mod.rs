//! POSIX-style permission checking.
//!
//! Decides whether a process running as `uid`/`gid` may read, write or
//! execute a file, the way the kernel would:
//!
//! 1. The owning user is judged by the owner bits alone.
//! 2. Otherwise a matching primary group is judged by the group bits.
//! 3. Otherwise, if the user's name is listed in the member list of the
//!    file's group, the group bits apply.
//! 4. Everyone else gets the "other" bits.
//!
//! Each step is final. An owner whose bits deny execute is denied even when
//! the group or other bits grant it.
//!
//! Steps 2-4 need a group/passwd directory service. Whether one exists is a
//! runtime [`DirectoryCapability`]; without it only the owner check runs and
//! any other identity is let through unchecked.

use std::fmt;
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

pub use nix::unistd::AccessFlags as AccessMode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::identity::IdentityDirectory;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;

const S_IRUSR: u32 = 0o400;
const S_IWUSR: u32 = 0o200;
const S_IXUSR: u32 = 0o100;
const S_IRGRP: u32 = 0o040;
const S_IWGRP: u32 = 0o020;
const S_IXGRP: u32 = 0o010;
const S_IROTH: u32 = 0o004;
const S_IWOTH: u32 = 0o002;
const S_IXOTH: u32 = 0o001;

// ─────────────────────────────────────────────────────────────────────────────
// File Status
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of the `stat` fields the checker needs.
///
/// A `mode` of zero stands for "no such file"; callers that pre-populate a
/// snapshot for a missing file use [`FileStatus::missing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStatus {
    /// Full `st_mode`, type bits included.
    pub mode: u32,
    /// Owning user id.
    pub uid: libc::uid_t,
    /// Owning group id.
    pub gid: libc::gid_t,
}

impl FileStatus {
    /// Build a snapshot from explicit values.
    #[must_use]
    pub const fn new(mode: u32, uid: libc::uid_t, gid: libc::gid_t) -> Self {
        Self { mode, uid, gid }
    }

    /// Snapshot describing a file that does not exist.
    #[must_use]
    pub const fn missing() -> Self {
        Self {
            mode: 0,
            uid: 0,
            gid: 0,
        }
    }

    /// `stat` the path (following symlinks).
    ///
    /// # Errors
    ///
    /// Returns the I/O error from the underlying `stat` call.
    pub fn stat(path: &Path) -> io::Result<Self> {
        std::fs::metadata(path).map(|meta| Self::from(&meta))
    }

    /// Whether the snapshot describes an existing file.
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.mode != 0
    }

    /// Whether the snapshot describes a directory.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    const fn has(&self, bit: u32) -> bool {
        self.mode & bit != 0
    }
}

impl From<&Metadata> for FileStatus {
    fn from(meta: &Metadata) -> Self {
        Self {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a group/passwd directory service is available to the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryCapability {
    /// Group, membership and other checks are performed.
    Available,
    /// Only the owner check is performed; non-owners are allowed.
    Unavailable,
}

impl DirectoryCapability {
    /// Capability of the platform this binary was built for.
    #[must_use]
    pub const fn detect() -> Self {
        if cfg!(unix) {
            Self::Available
        } else {
            Self::Unavailable
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Class of principal whose permission bits decided the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalClass {
    /// The file's owning user.
    Owner,
    /// The file's group, matched by the caller's primary gid.
    Group,
    /// The file's group, matched through its member list.
    GroupMember,
    /// Anyone else.
    Other,
}

/// A single permission bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Read.
    Read,
    /// Write.
    Write,
    /// Execute (or search).
    Execute,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

/// Which bit failed for which class of principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessDenial {
    /// Principal class whose bits were consulted.
    pub class: PrincipalClass,
    /// The first requested permission that was missing.
    pub permission: Permission,
}

impl fmt::Display for AccessDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            PrincipalClass::Owner => write!(f, "{} not allowed by owner", self.permission),
            PrincipalClass::Group | PrincipalClass::GroupMember => {
                write!(f, "{} not allowed by group", self.permission)
            },
            PrincipalClass::Other => write!(f, "{} not allowed", self.permission),
        }
    }
}

/// Outcome of a failed access check.
#[derive(Debug, Error)]
pub enum AccessError {
    /// The file status could not be obtained.
    #[error("stat() failed for {}: {source}", path.display())]
    StatFailed {
        /// Path that was stat'ed.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A requested permission bit is not granted.
    #[error("{0}")]
    Denied(AccessDenial),
}

impl AccessError {
    /// The denial details, if this is a permission failure.
    #[must_use]
    pub const fn denial(&self) -> Option<&AccessDenial> {
        match self {
            Self::Denied(denial) => Some(denial),
            Self::StatFailed { .. } => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Checker
// ─────────────────────────────────────────────────────────────────────────────

/// Permission checker bound to an identity directory.
#[derive(Clone, Copy)]
pub struct AccessChecker<'a> {
    directory: &'a dyn IdentityDirectory,
    capability: DirectoryCapability,
}

impl fmt::Debug for AccessChecker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessChecker")
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl<'a> AccessChecker<'a> {
    /// Create a checker using `directory` for membership lookups.
    #[must_use]
    pub fn new(directory: &'a dyn IdentityDirectory, capability: DirectoryCapability) -> Self {
        Self {
            directory,
            capability,
        }
    }

    /// Determine whether `uid`/`gid` may access `path` with `mode`.
    ///
    /// When `status` is `None` the path is stat'ed first.
    ///
    /// # Errors
    ///
    /// - [`AccessError::StatFailed`] if no snapshot was given and `stat`
    ///   fails.
    /// - [`AccessError::Denied`] naming the principal class and the first
    ///   missing bit.
    pub fn check(
        &self,
        path: &Path,
        status: Option<&FileStatus>,
        mode: AccessMode,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Result<(), AccessError> {
        let stat;
        let status = if let Some(status) = status {
            status
        } else {
            stat = FileStatus::stat(path).map_err(|source| AccessError::StatFailed {
                path: path.to_path_buf(),
                source,
            })?;
            &stat
        };

        let result = self.evaluate(status, mode, uid, gid);
        if let Err(denial) = &result {
            warn!(
                path = %path.display(),
                uid,
                gid,
                class = ?denial.class,
                permission = %denial.permission,
                "access denied"
            );
        }
        result.map_err(AccessError::Denied)
    }

    fn evaluate(
        &self,
        status: &FileStatus,
        mode: AccessMode,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Result<(), AccessDenial> {
        if uid == status.uid {
            return require(
                status,
                mode,
                PrincipalClass::Owner,
                [S_IRUSR, S_IWUSR, S_IXUSR],
            );
        }

        if self.capability == DirectoryCapability::Unavailable {
            warn!(
                uid,
                owner = status.uid,
                "no directory service; non-owner allowed without group/other check"
            );
            return Ok(());
        }

        let group_bits = [S_IRGRP, S_IWGRP, S_IXGRP];
        if gid == status.gid {
            return require(status, mode, PrincipalClass::Group, group_bits);
        }

        if self.is_group_member(uid, status.gid) {
            return require(status, mode, PrincipalClass::GroupMember, group_bits);
        }

        require(
            status,
            mode,
            PrincipalClass::Other,
            [S_IROTH, S_IWOTH, S_IXOTH],
        )
    }

    /// Whether the user named by `uid` appears in the member list of `gid`.
    /// Lookup failures count as "not a member".
    fn is_group_member(&self, uid: libc::uid_t, gid: libc::gid_t) -> bool {
        let group = match self.directory.group(gid) {
            Ok(Some(group)) => group,
            Ok(None) => return false,
            Err(err) => {
                debug!(gid, error = %err, "group lookup failed");
                return false;
            },
        };
        let user = match self.directory.user_name(uid) {
            Ok(Some(name)) => name,
            Ok(None) => return false,
            Err(err) => {
                debug!(uid, error = %err, "user lookup failed");
                return false;
            },
        };
        group.members.iter().any(|member| *member == user)
    }
}

/// Check every requested permission against the `[read, write, execute]`
/// bits of one principal class, in that order.
fn require(
    status: &FileStatus,
    mode: AccessMode,
    class: PrincipalClass,
    [read, write, execute]: [u32; 3],
) -> Result<(), AccessDenial> {
    let wanted = [
        (AccessMode::R_OK, read, Permission::Read),
        (AccessMode::W_OK, write, Permission::Write),
        (AccessMode::X_OK, execute, Permission::Execute),
    ];
    for (flag, bit, permission) in wanted {
        if mode.contains(flag) && !status.has(bit) {
            return Err(AccessDenial { class, permission });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryDirectory;

    const REGULAR: u32 = 0o100_000;

    fn directory() -> MemoryDirectory {
        MemoryDirectory::new()
            .with_user(100, "owner")
            .with_user(999, "alice")
            .with_user(500, "mallory")
            .with_group(10, "staff", &["alice", "bob"])
    }

    fn check(
        dir: &MemoryDirectory,
        status: FileStatus,
        mode: AccessMode,
        uid: u32,
        gid: u32,
    ) -> Result<(), AccessError> {
        AccessChecker::new(dir, DirectoryCapability::Available).check(
            Path::new("/srv/app"),
            Some(&status),
            mode,
            uid,
            gid,
        )
    }

    #[test]
    fn owner_bits_short_circuit() {
        let dir = directory();
        // rw- for owner, everything for group and other.
        let status = FileStatus::new(REGULAR | 0o677, 100, 10);
        let err = check(&dir, status, AccessMode::X_OK, 100, 10).unwrap_err();
        assert_eq!(err.to_string(), "execute not allowed by owner");
        assert_eq!(
            err.denial(),
            Some(&AccessDenial {
                class: PrincipalClass::Owner,
                permission: Permission::Execute,
            })
        );
    }

    #[test]
    fn owner_granted_even_when_others_denied() {
        let dir = directory();
        let status = FileStatus::new(REGULAR | 0o700, 100, 10);
        check(
            &dir,
            status,
            AccessMode::R_OK | AccessMode::W_OK | AccessMode::X_OK,
            100,
            77,
        )
        .unwrap();
    }

    #[test]
    fn owner_reports_first_missing_bit() {
        let dir = directory();
        let status = FileStatus::new(REGULAR | 0o100, 100, 10);
        let err = check(&dir, status, AccessMode::R_OK | AccessMode::X_OK, 100, 10).unwrap_err();
        assert_eq!(err.to_string(), "read not allowed by owner");

        let status = FileStatus::new(REGULAR | 0o500, 100, 10);
        let err = check(&dir, status, AccessMode::W_OK, 100, 10).unwrap_err();
        assert_eq!(err.to_string(), "write not allowed by owner");
    }

    #[test]
    fn primary_group_bits_short_circuit() {
        let dir = directory();
        let status = FileStatus::new(REGULAR | 0o704, 200, 10);
        let err = check(&dir, status, AccessMode::R_OK, 500, 10).unwrap_err();
        assert_eq!(err.to_string(), "read not allowed by group");
        assert_eq!(err.denial().unwrap().class, PrincipalClass::Group);
    }

    #[test]
    fn group_membership_grants_group_bits() {
        let dir = directory();
        // r-- for group, nothing for other.
        let status = FileStatus::new(REGULAR | 0o040, 200, 10);
        check(&dir, status, AccessMode::R_OK, 999, 20).unwrap();

        let err = check(&dir, status, AccessMode::X_OK, 999, 20).unwrap_err();
        assert_eq!(err.to_string(), "execute not allowed by group");
        assert_eq!(err.denial().unwrap().class, PrincipalClass::GroupMember);
    }

    #[test]
    fn non_member_falls_through_to_other() {
        let dir = directory();
        let status = FileStatus::new(REGULAR | 0o070, 200, 10);
        let err = check(&dir, status, AccessMode::R_OK, 500, 20).unwrap_err();
        assert_eq!(err.to_string(), "read not allowed");
        assert_eq!(err.denial().unwrap().class, PrincipalClass::Other);

        let status = FileStatus::new(REGULAR | 0o001, 200, 10);
        check(&dir, status, AccessMode::X_OK, 500, 20).unwrap();
    }

    #[test]
    fn unknown_user_is_not_a_member() {
        let dir = directory();
        let status = FileStatus::new(REGULAR | 0o070, 200, 10);
        let err = check(&dir, status, AccessMode::W_OK, 4321, 20).unwrap_err();
        assert_eq!(err.to_string(), "write not allowed");
    }

    #[test]
    fn without_directory_service_non_owner_is_allowed() {
        let dir = directory();
        let status = FileStatus::new(REGULAR, 200, 10);
        let checker = AccessChecker::new(&dir, DirectoryCapability::Unavailable);
        checker
            .check(Path::new("/x"), Some(&status), AccessMode::X_OK, 500, 20)
            .unwrap();

        // The owner check still applies.
        let err = checker
            .check(Path::new("/x"), Some(&status), AccessMode::X_OK, 200, 20)
            .unwrap_err();
        assert_eq!(err.to_string(), "execute not allowed by owner");
    }

    #[test]
    fn stats_path_when_no_snapshot() {
        let dir = directory();
        let checker = AccessChecker::new(&dir, DirectoryCapability::Available);
        let file = tempfile::NamedTempFile::new().unwrap();
        let meta = std::fs::metadata(file.path()).unwrap();
        checker
            .check(file.path(), None, AccessMode::R_OK, meta.uid(), meta.gid())
            .unwrap();
    }

    #[test]
    fn stat_failure_carries_system_error() {
        let dir = directory();
        let checker = AccessChecker::new(&dir, DirectoryCapability::Available);
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("absent");
        let err = checker
            .check(&missing, None, AccessMode::R_OK, 0, 0)
            .unwrap_err();
        match &err {
            AccessError::StatFailed { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            },
            AccessError::Denied(_) => panic!("expected StatFailed, got {err:?}"),
        }
        assert!(err.to_string().starts_with("stat() failed"));
    }

    #[test]
    fn file_status_classification() {
        assert!(!FileStatus::missing().exists());
        assert!(FileStatus::new(S_IFDIR | 0o755, 0, 0).is_dir());
        assert!(!FileStatus::new(REGULAR | 0o755, 0, 0).is_dir());
    }
}
