//! Gateway configuration.
//!
//! Process-wide settings read once at startup and consumed read-only by the
//! registry, the permission checker and the socket naming code: whether
//! privilege separation (suexec) is enabled, where static and dynamic sockets
//! live, the identity the gateway itself runs as, and the defaults applied to
//! every new server record.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::DirectoryCapability;
use crate::socket::{self, AddressError};

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Gateway-wide settings.
    #[serde(default)]
    pub gateway: GatewaySection,

    /// Defaults for newly created server records.
    #[serde(default)]
    pub server_defaults: ServerDefaults,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check values serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.gateway.socket_dir.is_absolute() {
            return Err(ConfigError::Validation(format!(
                "gateway.socket_dir must be absolute, got {}",
                self.gateway.socket_dir.display()
            )));
        }
        if let Some(dynamic) = &self.gateway.dynamic_dir {
            if !dynamic.is_absolute() {
                return Err(ConfigError::Validation(format!(
                    "gateway.dynamic_dir must be absolute, got {}",
                    dynamic.display()
                )));
            }
        }
        if self.server_defaults.listen_queue_depth == 0 {
            return Err(ConfigError::Validation(
                "server_defaults.listen_queue_depth must be greater than zero".to_string(),
            ));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.server_defaults.process_priority) {
            return Err(ConfigError::Validation(format!(
                "server_defaults.process_priority must be within {MIN_PRIORITY}..={MAX_PRIORITY}, got {}",
                self.server_defaults.process_priority
            )));
        }
        Ok(())
    }

    /// Whether privilege separation is enabled.
    #[must_use]
    pub const fn suexec_enabled(&self) -> bool {
        self.gateway.suexec.is_some()
    }

    /// Root directory for dynamic sockets.
    #[must_use]
    pub fn dynamic_dir(&self) -> PathBuf {
        self.gateway
            .dynamic_dir
            .clone()
            .unwrap_or_else(|| self.gateway.socket_dir.join(DEFAULT_DYNAMIC_SUBDIR))
    }

    /// Absolute path of socket `name` in the static or dynamic directory.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::InvalidSocketName`] if `name` cannot be joined
    /// under the directory.
    pub fn socket_path(&self, name: &str, dynamic: bool) -> Result<PathBuf, AddressError> {
        if dynamic {
            socket::socket_path(&self.dynamic_dir(), name)
        } else {
            socket::socket_path(&self.gateway.socket_dir, name)
        }
    }

    /// Directory service capability after resolving `auto`.
    #[must_use]
    pub const fn directory_capability(&self) -> DirectoryCapability {
        match self.gateway.directory_service {
            DirectoryService::Auto => DirectoryCapability::detect(),
            DirectoryService::Available => DirectoryCapability::Available,
            DirectoryService::Unavailable => DirectoryCapability::Unavailable,
        }
    }
}

/// `[gateway]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Path of the suexec wrapper. Its presence enables privilege
    /// separation.
    #[serde(default)]
    pub suexec: Option<PathBuf>,

    /// Directory holding static application sockets.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Directory holding dynamic application sockets. Defaults to
    /// `<socket_dir>/dynamic`.
    #[serde(default)]
    pub dynamic_dir: Option<PathBuf>,

    /// Uid the gateway runs applications as when suexec is disabled.
    #[serde(default = "default_user_id")]
    pub user_id: u32,

    /// Gid the gateway runs applications as when suexec is disabled.
    #[serde(default = "default_group_id")]
    pub group_id: u32,

    /// Whether group/passwd lookups are available to the permission checker.
    #[serde(default)]
    pub directory_service: DirectoryService,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            suexec: None,
            socket_dir: default_socket_dir(),
            dynamic_dir: None,
            user_id: default_user_id(),
            group_id: default_group_id(),
            directory_service: DirectoryService::default(),
        }
    }
}

/// Directory service setting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryService {
    /// Use whatever the platform provides.
    #[default]
    Auto,
    /// Force group and other checks on.
    Available,
    /// Owner-only checks.
    Unavailable,
}

/// `[server_defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerDefaults {
    /// Backlog passed to `listen(2)`.
    #[serde(default = "default_listen_queue_depth")]
    pub listen_queue_depth: u32,

    /// Time allowed for establishing a connection to the application.
    /// Zero means a blocking connect.
    #[serde(default, with = "humantime_serde")]
    pub app_connect_timeout: Duration,

    /// Delay before the first start of an application process.
    #[serde(default = "default_init_start_delay", with = "humantime_serde")]
    pub init_start_delay: Duration,

    /// Minimum delay between restarts of a failing application.
    #[serde(default = "default_restart_delay", with = "humantime_serde")]
    pub restart_delay: Duration,

    /// Scheduling priority (nice value) of application processes.
    #[serde(default)]
    pub process_priority: i32,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            listen_queue_depth: default_listen_queue_depth(),
            app_connect_timeout: Duration::ZERO,
            init_start_delay: default_init_start_delay(),
            restart_delay: default_restart_delay(),
            process_priority: 0,
        }
    }
}

const DEFAULT_DYNAMIC_SUBDIR: &str = "dynamic";
const MIN_PRIORITY: i32 = -20;
const MAX_PRIORITY: i32 = 19;

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/fcgi")
}

fn default_user_id() -> u32 {
    nix::unistd::geteuid().as_raw()
}

fn default_group_id() -> u32 {
    nix::unistd::getegid().as_raw()
}

const fn default_listen_queue_depth() -> u32 {
    100
}

const fn default_init_start_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_restart_delay() -> Duration {
    Duration::from_secs(5)
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
