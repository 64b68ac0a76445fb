//! Unix-domain and IPv4 socket addresses.
//!
//! Addresses are kept in their kernel layout (`sockaddr_un` / `sockaddr_in`)
//! together with the exact length to hand to `bind(2)` or `connect(2)`. For
//! Unix-domain sockets that length is the offset of `sun_path` plus the path
//! plus its NUL, not `size_of::<sockaddr_un>()`.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{is_nul_free, AddressError};

/// Address family of a [`SocketAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// `AF_UNIX`
    Unix,
    /// `AF_INET`
    Inet,
}

/// A socket address with its serialized length.
#[derive(Debug, Clone)]
pub enum SocketAddress {
    /// Unix-domain socket.
    Unix(UnixAddress),
    /// IPv4 socket.
    Inet(InetAddress),
}

impl SocketAddress {
    /// Family tag of the address.
    #[must_use]
    pub const fn family(&self) -> AddressFamily {
        match self {
            Self::Unix(_) => AddressFamily::Unix,
            Self::Inet(_) => AddressFamily::Inet,
        }
    }

    /// Number of bytes of [`Self::as_ptr`] that form the address.
    #[must_use]
    pub const fn len(&self) -> libc::socklen_t {
        match self {
            Self::Unix(addr) => addr.len(),
            Self::Inet(addr) => addr.len(),
        }
    }

    /// Always `false`; a socket address carries at least its family tag.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Pointer to the raw address, valid for [`Self::len`] bytes while
    /// `self` is alive.
    #[must_use]
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        match self {
            Self::Unix(addr) => std::ptr::addr_of!(addr.raw).cast(),
            Self::Inet(addr) => std::ptr::addr_of!(addr.raw).cast(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unix-domain
// ─────────────────────────────────────────────────────────────────────────────

/// A `sockaddr_un` whose path is known to fit.
#[derive(Clone)]
pub struct UnixAddress {
    raw: libc::sockaddr_un,
    len: libc::socklen_t,
    path: PathBuf,
}

impl UnixAddress {
    /// Capacity of `sun_path` on this platform, NUL terminator included.
    #[must_use]
    pub fn capacity() -> usize {
        zeroed_sockaddr_un().sun_path.len()
    }

    /// Build the address for `path`.
    ///
    /// # Errors
    ///
    /// - [`AddressError::PathTooLong`] if `path` plus its NUL does not fit in
    ///   `sun_path`.
    /// - [`AddressError::InteriorNul`] if `path` contains a NUL byte.
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub fn new(path: &Path) -> Result<Self, AddressError> {
        let bytes = path.as_os_str().as_bytes();
        let capacity = Self::capacity();
        if bytes.len() >= capacity {
            return Err(AddressError::PathTooLong {
                path: path.to_path_buf(),
                capacity,
            });
        }
        if !is_nul_free(path) {
            return Err(AddressError::InteriorNul {
                path: path.to_path_buf(),
            });
        }

        let mut raw = zeroed_sockaddr_un();
        raw.sun_family = sa_family(libc::AF_UNIX);
        for (dst, src) in raw.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }

        let len = mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
        let len = socklen(len);
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly"
        ))]
        {
            raw.sun_len = len as u8;
        }

        Ok(Self {
            raw,
            len,
            path: path.to_path_buf(),
        })
    }

    /// The socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialized length: `offsetof(sun_path) + strlen(path) + 1`.
    #[must_use]
    pub const fn len(&self) -> libc::socklen_t {
        self.len
    }

    /// Always `false`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// The raw kernel structure.
    #[must_use]
    pub const fn as_raw(&self) -> &libc::sockaddr_un {
        &self.raw
    }
}

impl fmt::Debug for UnixAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixAddress")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Build a Unix-domain address for `path`.
///
/// # Errors
///
/// See [`UnixAddress::new`].
pub fn build_unix_address(path: impl AsRef<Path>) -> Result<SocketAddress, AddressError> {
    UnixAddress::new(path.as_ref()).map(SocketAddress::Unix)
}

fn zeroed_sockaddr_un() -> libc::sockaddr_un {
    // SAFETY: `sockaddr_un` is a plain C struct for which all-zero bytes are
    // a valid (empty, AF_UNSPEC) value.
    #[allow(unsafe_code)]
    unsafe {
        mem::zeroed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// IPv4
// ─────────────────────────────────────────────────────────────────────────────

/// A `sockaddr_in`.
#[derive(Clone, Copy)]
pub struct InetAddress {
    raw: libc::sockaddr_in,
}

impl InetAddress {
    /// Build the address for `ip:port`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        // SAFETY: `sockaddr_in` is a plain C struct; all-zero is valid.
        #[allow(unsafe_code)]
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        raw.sin_family = sa_family(libc::AF_INET);
        raw.sin_port = port.to_be();
        raw.sin_addr.s_addr = u32::from(ip).to_be();
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly"
        ))]
        {
            raw.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
        }
        Self { raw }
    }

    /// IPv4 address in host representation.
    #[must_use]
    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.raw.sin_addr.s_addr))
    }

    /// Port in host byte order.
    #[must_use]
    pub const fn port(&self) -> u16 {
        u16::from_be(self.raw.sin_port)
    }

    /// `size_of::<sockaddr_in>()`.
    #[must_use]
    pub const fn len(&self) -> libc::socklen_t {
        socklen(mem::size_of::<libc::sockaddr_in>())
    }

    /// Always `false`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// The raw kernel structure (port and address in network byte order).
    #[must_use]
    pub const fn as_raw(&self) -> &libc::sockaddr_in {
        &self.raw
    }
}

impl From<InetAddress> for SocketAddrV4 {
    fn from(addr: InetAddress) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InetAddress")
            .field("ip", &self.ip())
            .field("port", &self.port())
            .finish()
    }
}

/// Name resolution used for IPv4 host names.
pub trait HostResolver {
    /// Every IPv4 address `host` resolves to.
    ///
    /// # Errors
    ///
    /// Returns the resolver's error when the lookup fails.
    fn resolve_ipv4(&self, host: &str) -> io::Result<Vec<Ipv4Addr>>;
}

/// The system resolver (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve_ipv4(&self, host: &str) -> io::Result<Vec<Ipv4Addr>> {
        Ok((host, 0)
            .to_socket_addrs()?
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .collect())
    }
}

/// Build an IPv4 address using the system resolver.
///
/// # Errors
///
/// See [`build_inet_address_with`].
pub fn build_inet_address(host: Option<&str>, port: u16) -> Result<SocketAddress, AddressError> {
    build_inet_address_with(&SystemResolver, host, port)
}

/// Build an IPv4 address for `host:port`.
///
/// With no host the wildcard address is used. A host is first parsed as a
/// dotted-quad literal, then handed to `resolver`. The host must map to
/// exactly one address: an ambiguous name is rejected rather than bound to
/// whichever address came first.
///
/// # Errors
///
/// Returns [`AddressError::ResolutionFailed`] if resolution fails or yields
/// zero or several distinct addresses.
pub fn build_inet_address_with(
    resolver: &dyn HostResolver,
    host: Option<&str>,
    port: u16,
) -> Result<SocketAddress, AddressError> {
    let ip = match host {
        None => Ipv4Addr::UNSPECIFIED,
        Some(host) => resolve_single(resolver, host)?,
    };
    Ok(SocketAddress::Inet(InetAddress::new(ip, port)))
}

fn resolve_single(resolver: &dyn HostResolver, host: &str) -> Result<Ipv4Addr, AddressError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    let candidates: BTreeSet<Ipv4Addr> = match resolver.resolve_ipv4(host) {
        Ok(addrs) => addrs.into_iter().collect(),
        Err(err) => {
            debug!(host, error = %err, "host resolution failed");
            return Err(AddressError::ResolutionFailed {
                host: host.to_string(),
                candidates: 0,
                reason: Some(err.to_string()),
            });
        },
    };

    let mut iter = candidates.iter();
    match (iter.next(), iter.next()) {
        (Some(ip), None) => Ok(*ip),
        _ => {
            debug!(host, candidates = candidates.len(), "host is not a single address");
            Err(AddressError::ResolutionFailed {
                host: host.to_string(),
                candidates: candidates.len(),
                reason: None,
            })
        },
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn sa_family(family: libc::c_int) -> libc::sa_family_t {
    family as libc::sa_family_t
}

#[allow(clippy::cast_possible_truncation)]
const fn socklen(len: usize) -> libc::socklen_t {
    len as libc::socklen_t
}
