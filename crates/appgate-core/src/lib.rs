//! # appgate-core
//!
//! Connection addressing and access control for a multi-process
//! external-application gateway.
//!
//! Given a configured application (filesystem path plus optional
//! per-application credentials) this crate:
//!
//! - builds correctly sized Unix-domain or IPv4 socket addresses for
//!   contacting or listening on behalf of the application ([`socket`])
//! - decides whether a process identity may execute or access a path using
//!   POSIX owner/group/other semantics ([`access`])
//! - resolves numeric uid/gid pairs to symbolic names ([`identity`])
//! - keeps the registry of configured application servers ([`registry`])
//! - allocates the per-server process table ([`process`])
//! - wraps `fcntl` record locking for per-socket lock files ([`lock`])
//!
//! The [`Gateway`] context owns the configuration, the registry and the
//! identity directory; routers and supervisors borrow it instead of reaching
//! for process-wide state.
//!
//! ## Example
//!
//! ```rust,no_run
//! use appgate_core::{Gateway, GatewayConfig};
//!
//! let config = GatewayConfig::from_toml(
//!     r#"
//!     [gateway]
//!     socket_dir = "/tmp/appgate"
//!     "#,
//! )?;
//! let mut gateway = Gateway::new(config);
//!
//! let mut record = gateway.new_record("/srv/app/index.fcgi");
//! record.allocate_processes(4);
//! gateway.insert(record);
//!
//! let found = gateway.find_by_identity("/srv/app/index.fcgi", 0, 0);
//! assert!(found.is_some());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![cfg(unix)]

pub mod access;
pub mod config;
pub mod gateway;
pub mod identity;
pub mod lock;
pub mod process;
pub mod registry;
pub mod socket;

pub use access::{AccessError, AccessMode, DirectoryCapability, FileStatus};
pub use config::{ConfigError, GatewayConfig};
pub use gateway::Gateway;
pub use identity::{Identity, IdentityDirectory, IdentityError, SystemDirectory};
pub use lock::{LockCommand, LockError, LockType, Whence};
pub use process::{ProcessSlot, ProcessState};
pub use registry::{AppClass, PathValidationError, ServerRecord, ServerRegistry};
pub use socket::{AddressError, SocketAddress, SocketLock};
