//! Numeric to symbolic identity resolution.
//!
//! Privilege-separated applications are spawned through a wrapper that takes
//! user and group *names*, so every server record that runs under its own
//! uid/gid needs them resolved up front. The [`IdentityDirectory`] trait is
//! the seam to the passwd/group database; [`SystemDirectory`] is the real
//! one and [`MemoryDirectory`] an in-process table.

use std::collections::HashMap;
use std::io;

use nix::unistd::{Gid, Group, Uid, User};
use thiserror::Error;

/// A group entry: its name and the users listed as members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    /// Group name.
    pub name: String,
    /// Supplementary members by user name.
    pub members: Vec<String>,
}

/// Lookup interface to the passwd/group database.
pub trait IdentityDirectory: Send + Sync {
    /// Name of the user with `uid`, `None` if there is no such user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database could not be consulted.
    fn user_name(&self, uid: libc::uid_t) -> io::Result<Option<String>>;

    /// Group entry for `gid`, `None` if there is no such group.
    ///
    /// # Errors
    ///
    /// Returns an error if the database could not be consulted.
    fn group(&self, gid: libc::gid_t) -> io::Result<Option<GroupEntry>>;
}

/// The host's passwd/group database (`getpwuid_r`/`getgrgid_r`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDirectory;

impl IdentityDirectory for SystemDirectory {
    fn user_name(&self, uid: libc::uid_t) -> io::Result<Option<String>> {
        Ok(User::from_uid(Uid::from_raw(uid))?.map(|user| user.name))
    }

    fn group(&self, gid: libc::gid_t) -> io::Result<Option<GroupEntry>> {
        Ok(Group::from_gid(Gid::from_raw(gid))?.map(|group| GroupEntry {
            name: group.name,
            members: group.mem,
        }))
    }
}

/// Fixed in-memory passwd/group table.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    users: HashMap<libc::uid_t, String>,
    groups: HashMap<libc::gid_t, GroupEntry>,
}

impl MemoryDirectory {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user.
    #[must_use]
    pub fn with_user(mut self, uid: libc::uid_t, name: impl Into<String>) -> Self {
        self.users.insert(uid, name.into());
        self
    }

    /// Add a group with its member list.
    #[must_use]
    pub fn with_group(mut self, gid: libc::gid_t, name: impl Into<String>, members: &[&str]) -> Self {
        self.groups.insert(
            gid,
            GroupEntry {
                name: name.into(),
                members: members.iter().map(ToString::to_string).collect(),
            },
        );
        self
    }
}

impl IdentityDirectory for MemoryDirectory {
    fn user_name(&self, uid: libc::uid_t) -> io::Result<Option<String>> {
        Ok(self.users.get(&uid).cloned())
    }

    fn group(&self, gid: libc::gid_t) -> io::Result<Option<GroupEntry>> {
        Ok(self.groups.get(&gid).cloned())
    }
}

/// Errors resolving an identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No passwd entry for the uid.
    #[error("couldn't determine the username for uid '{uid}', check the configured User")]
    UnknownUser {
        /// The uid that has no entry.
        uid: libc::uid_t,
    },

    /// No group entry for the gid.
    #[error("couldn't determine the group name for gid '{gid}', check the configured Group")]
    UnknownGroup {
        /// The gid that has no entry.
        gid: libc::gid_t,
    },

    /// The directory lookup itself failed.
    #[error("{kind} lookup for id '{id}' failed: {source}")]
    Lookup {
        /// `"user"` or `"group"`.
        kind: &'static str,
        /// The numeric id being looked up.
        id: u32,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// A uid/gid pair with its symbolic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Numeric user id.
    pub uid: libc::uid_t,
    /// Numeric group id.
    pub gid: libc::gid_t,
    /// User name for `uid`.
    pub user: String,
    /// Group name for `gid`.
    pub group: String,
}

/// Resolve `uid` and `gid` to their names.
///
/// # Errors
///
/// Returns an [`IdentityError`] naming the numeric id that could not be
/// resolved.
pub fn resolve_identity(
    directory: &dyn IdentityDirectory,
    uid: libc::uid_t,
    gid: libc::gid_t,
) -> Result<Identity, IdentityError> {
    let user = directory
        .user_name(uid)
        .map_err(|source| IdentityError::Lookup {
            kind: "user",
            id: uid,
            source,
        })?
        .ok_or(IdentityError::UnknownUser { uid })?;

    let group = directory
        .group(gid)
        .map_err(|source| IdentityError::Lookup {
            kind: "group",
            id: gid,
            source,
        })?
        .ok_or(IdentityError::UnknownGroup { gid })?
        .name;

    Ok(Identity {
        uid,
        gid,
        user,
        group,
    })
}
