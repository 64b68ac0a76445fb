//! Gateway context.
//!
//! [`Gateway`] ties the read-only configuration to the server registry and
//! the identity directory. The configuration loader builds one, fills the
//! registry, and then hands it by reference to the request router and the
//! process supervisor.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::access::{AccessChecker, AccessError, AccessMode, DirectoryCapability, FileStatus};
use crate::config::GatewayConfig;
use crate::identity::{resolve_identity, IdentityDirectory, IdentityError, SystemDirectory};
use crate::registry::{
    validate_path, CheckedIdentity, PathValidationError, ServerRecord, ServerRegistry,
};
use crate::socket::{hash_socket_name, AddressError};

/// Configuration, registry and identity directory of one gateway instance.
pub struct Gateway {
    config: GatewayConfig,
    registry: ServerRegistry,
    directory: Box<dyn IdentityDirectory>,
    capability: DirectoryCapability,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// A gateway using the host's passwd/group database.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_directory(config, Box::new(SystemDirectory))
    }

    /// A gateway using `directory` for identity lookups.
    #[must_use]
    pub fn with_directory(config: GatewayConfig, directory: Box<dyn IdentityDirectory>) -> Self {
        let registry = ServerRegistry::new(config.suexec_enabled());
        let capability = config.directory_capability();
        Self {
            config,
            registry,
            directory,
            capability,
        }
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The server registry.
    #[must_use]
    pub const fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Mutable registry, for the supervisor's process tables.
    pub fn registry_mut(&mut self) -> &mut ServerRegistry {
        &mut self.registry
    }

    /// Permission checker bound to this gateway's directory.
    #[must_use]
    pub fn checker(&self) -> AccessChecker<'_> {
        AccessChecker::new(self.directory.as_ref(), self.capability)
    }

    /// A new record for `fs_path` carrying the configured server defaults.
    #[must_use]
    pub fn new_record(&self, fs_path: impl Into<PathBuf>) -> ServerRecord {
        ServerRecord::with_defaults(fs_path, &self.config.server_defaults)
    }

    /// Attach the run-as identity `uid`/`gid` to `record`.
    ///
    /// Does nothing unless privilege separation is enabled.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] if either id has no symbolic name.
    pub fn assign_identity(
        &self,
        record: &mut ServerRecord,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Result<(), IdentityError> {
        if !self.config.suexec_enabled() {
            return Ok(());
        }
        let identity = resolve_identity(self.directory.as_ref(), uid, gid)?;
        debug!(
            path = %record.fs_path.display(),
            user = %identity.user,
            group = %identity.group,
            "assigned suexec identity"
        );
        record.identity = Some(identity);
        Ok(())
    }

    /// Add `record` to the registry.
    pub fn insert(&mut self, record: ServerRecord) {
        self.registry.insert(record);
    }

    /// See [`ServerRegistry::find_by_identity`].
    #[must_use]
    pub fn find_by_identity(
        &self,
        path: impl AsRef<Path>,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Option<&ServerRecord> {
        self.registry.find_by_identity(path, uid, gid)
    }

    /// See [`ServerRegistry::find_by_names`].
    #[must_use]
    pub fn find_by_names(
        &self,
        path: impl AsRef<Path>,
        user: &str,
        group: &str,
    ) -> Option<&ServerRecord> {
        self.registry.find_by_names(path, user, group)
    }

    /// Check that `path` can be run as an application.
    ///
    /// Under privilege separation the execute check uses `uid`/`gid`;
    /// otherwise it uses the gateway's own configured identity and the
    /// arguments are ignored.
    ///
    /// # Errors
    ///
    /// See [`validate_path`].
    pub fn validate_path(
        &self,
        path: &Path,
        status: Option<&FileStatus>,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Result<(), PathValidationError> {
        let (identity, uid, gid) = if self.config.suexec_enabled() {
            (CheckedIdentity::Suexec, uid, gid)
        } else {
            (
                CheckedIdentity::Server,
                self.config.gateway.user_id,
                self.config.gateway.group_id,
            )
        };
        validate_path(&self.checker(), path, status, identity, uid, gid)
    }

    /// Check `mode` access to `path` for `uid`/`gid`.
    ///
    /// # Errors
    ///
    /// See [`AccessChecker::check`].
    pub fn check_access(
        &self,
        path: &Path,
        status: Option<&FileStatus>,
        mode: AccessMode,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Result<(), AccessError> {
        self.checker().check(path, status, mode, uid, gid)
    }

    /// Socket path of a dynamic application run as `user`/`group`.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError`] if the hashed name cannot be joined under the
    /// dynamic directory.
    pub fn dynamic_socket_path(
        &self,
        fs_path: &str,
        user: &str,
        group: &str,
    ) -> Result<PathBuf, AddressError> {
        let name = hash_socket_name(fs_path, user, group);
        self.config.socket_path(&name, true)
    }
}
