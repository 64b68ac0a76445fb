//! Socket naming and address construction.
//!
//! Applications are reached either through a Unix-domain socket or an IPv4
//! host:port. Static sockets live under the configured socket directory with
//! a fixed name; dynamically spawned applications get a hashed name under the
//! dynamic directory so that different path/user/group combinations never
//! collide. Creation of a dynamic socket is serialized through an advisory
//! lock on `<socket>.lock`.

mod address;
mod lock;

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

pub use address::{
    build_inet_address, build_inet_address_with, build_unix_address, AddressFamily, HostResolver,
    InetAddress, SocketAddress, SystemResolver, UnixAddress,
};
pub use lock::{SocketLock, SocketLockError};
use thiserror::Error;

/// Length of the printable digest produced by [`hash_socket_name`].
pub const SOCKET_HASH_LEN: usize = 32;

/// Suffix appended to a socket path to name its lock file.
pub const LOCK_FILE_SUFFIX: &str = ".lock";

/// Errors building socket names and addresses.
#[derive(Debug, Error)]
pub enum AddressError {
    /// The path does not fit in the platform's `sun_path` field.
    #[error("path \"{}\" is too long for a Domain socket (limit {capacity} bytes including NUL)", path.display())]
    PathTooLong {
        /// The rejected path.
        path: PathBuf,
        /// Capacity of the `sun_path` field.
        capacity: usize,
    },

    /// The path contains a NUL byte and cannot be stored in `sun_path`.
    #[error("path \"{}\" contains a NUL byte", path.display())]
    InteriorNul {
        /// The rejected path.
        path: PathBuf,
    },

    /// The host did not resolve to exactly one IPv4 address.
    #[error("failed to resolve \"{host}\" to exactly one IP address (found {candidates}){}", reason_suffix(.reason.as_deref()))]
    ResolutionFailed {
        /// Host as given.
        host: String,
        /// Number of distinct IPv4 addresses found.
        candidates: usize,
        /// Resolver error text, when the lookup itself failed.
        reason: Option<String>,
    },

    /// A socket file name that cannot be joined under a socket directory.
    #[error("invalid socket name \"{name}\": {reason}")]
    InvalidSocketName {
        /// The rejected name.
        name: String,
        /// What is wrong with it.
        reason: &'static str,
    },
}

fn reason_suffix(reason: Option<&str>) -> String {
    reason.map(|r| format!(": {r}")).unwrap_or_default()
}

/// Derive the file name of a dynamic application's socket.
///
/// `path`, `user` and `group` are concatenated, the result has `.`, `..` and
/// repeated `/` collapsed, and the canonical string is hashed with BLAKE3.
/// The first [`SOCKET_HASH_LEN`] hex digits of the digest are returned.
#[must_use]
pub fn hash_socket_name(path: &str, user: &str, group: &str) -> String {
    let joined = format!("{path}{user}{group}");
    let canonical = collapse_parents(&joined);
    let digest = blake3::hash(canonical.as_bytes());
    digest.to_hex().as_str()[..SOCKET_HASH_LEN].to_string()
}

/// Lexically remove `.` segments, `..` segments with their parent, and
/// duplicate separators. A path that named a directory (trailing `/`, `.` or
/// `..`) keeps its trailing `/`. No filesystem access.
fn collapse_parents(path: &str) -> String {
    let absolute = path.starts_with('/');
    let trailing = path.ends_with('/')
        || path.ends_with("/.")
        || path.ends_with("/..")
        || path == "."
        || path == "..";

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {},
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                },
                _ if absolute => {},
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    if trailing && !segments.is_empty() {
        out.push('/');
    }
    out
}

/// Join a socket file `name` under `root`.
///
/// Only the shape of the result is checked; whether the directory exists is
/// discovered by whoever binds or connects to it.
///
/// # Errors
///
/// Returns [`AddressError::InvalidSocketName`] if `name` is empty, absolute,
/// contains a NUL byte or would escape `root` through `..`.
pub fn socket_path(root: &Path, name: &str) -> Result<PathBuf, AddressError> {
    let invalid = |reason| AddressError::InvalidSocketName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    if name.as_bytes().contains(&0) {
        return Err(invalid("contains a NUL byte"));
    }
    let relative = Path::new(name);
    if relative.is_absolute() {
        return Err(invalid("must be relative to the socket directory"));
    }
    if relative
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(invalid("must not contain '..'"));
    }
    Ok(root.join(relative))
}

/// Name of the lock file guarding creation of `socket_path`.
#[must_use]
pub fn lock_file_name(socket_path: &Path) -> PathBuf {
    let mut name = OsString::from(socket_path.as_os_str());
    name.push(LOCK_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Whether `path` is free of NUL bytes.
fn is_nul_free(path: &Path) -> bool {
    !path.as_os_str().as_bytes().contains(&0)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn hash_collapses_parent_segments() {
        assert_eq!(
            hash_socket_name("/tmp/a/../b", "u", "g"),
            hash_socket_name("/tmp/b", "u", "g")
        );
    }

    #[test]
    fn hash_collapses_dot_and_double_slash() {
        let expected = hash_socket_name("/srv/app/run.fcgi", "www", "web");
        assert_eq!(hash_socket_name("/srv//app/./run.fcgi", "www", "web"), expected);
        assert_eq!(hash_socket_name("/srv/x/y/../../app/run.fcgi", "www", "web"), expected);
    }

    #[test]
    fn hash_distinguishes_identity() {
        let a = hash_socket_name("/srv/app", "www", "web");
        let b = hash_socket_name("/srv/app", "www", "staff");
        let c = hash_socket_name("/srv/app", "nobody", "web");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hash_is_fixed_length_lowercase_hex() {
        let digest = hash_socket_name("/srv/app", "", "");
        assert_eq!(digest.len(), SOCKET_HASH_LEN);
        assert!(digest
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn collapse_parents_cases() {
        assert_eq!(collapse_parents("/a/b/../c"), "/a/c");
        assert_eq!(collapse_parents("/a/./b//c"), "/a/b/c");
        assert_eq!(collapse_parents("/../a"), "/a");
        assert_eq!(collapse_parents("../a/b/.."), "../a/");
        assert_eq!(collapse_parents("a/../../b"), "../b");
        assert_eq!(collapse_parents("/a/b/"), "/a/b/");
        assert_eq!(collapse_parents("/"), "/");
    }

    #[test]
    fn socket_path_joins_under_root() {
        let path = socket_path(Path::new("/tmp/fcgi"), "app.sock").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/fcgi/app.sock"));
    }

    #[test]
    fn socket_path_rejects_bad_names() {
        let root = Path::new("/tmp/fcgi");
        for name in ["", "/etc/passwd", "../escape", "a\0b"] {
            let err = socket_path(root, name).unwrap_err();
            assert!(
                matches!(err, AddressError::InvalidSocketName { .. }),
                "{name:?} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn lock_file_appends_suffix() {
        assert_eq!(
            lock_file_name(Path::new("/tmp/fcgi/dynamic/abc")),
            PathBuf::from("/tmp/fcgi/dynamic/abc.lock")
        );
    }

    proptest! {
        /// Inserting `x/..` before any segment does not change the digest.
        #[test]
        fn prop_hash_ignores_detours(
            segments in prop::collection::vec("[a-z0-9_]{1,8}", 1..6),
            detour in "[a-z0-9_]{1,8}",
            at in 0usize..6,
        ) {
            let at = at.min(segments.len() - 1);
            let plain = format!("/{}", segments.join("/"));
            let mut with_detour = segments.clone();
            with_detour.insert(at, format!("{detour}/.."));
            let detoured = format!("/{}", with_detour.join("/"));

            prop_assert_eq!(
                hash_socket_name(&plain, "u", "g"),
                hash_socket_name(&detoured, "u", "g")
            );
        }
    }
}
