//! Application server records.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ServerDefaults;
use crate::identity::Identity;
use crate::process::{allocate_process_table, ProcessSlot, ProcessState};
use crate::socket::SocketAddress;

/// Listen descriptor value of a record whose socket is not bound yet.
pub const UNBOUND_LISTEN_FD: RawFd = -2;

/// How an application is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppClass {
    /// Not yet classified.
    #[default]
    Unknown,
    /// Started at gateway startup with a fixed socket.
    Static,
    /// Managed outside the gateway; only connected to.
    External,
    /// Spawned on demand with a hashed socket name.
    Dynamic,
}

/// Configuration and runtime state for one external application.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    /// Filesystem path of the application executable.
    pub fs_path: PathBuf,
    /// Identity the application runs as when privilege separation is on.
    pub identity: Option<Identity>,
    /// Backlog passed to `listen(2)`.
    pub listen_queue_depth: u32,
    /// Connect timeout; zero means blocking.
    pub app_connect_timeout: Duration,
    /// Delay before the first start.
    pub init_start_delay: Duration,
    /// Minimum delay between restarts.
    pub restart_delay: Duration,
    /// Whether to restart the application even after a clean exit.
    pub restart_on_exit: bool,
    /// Nice value of the application processes.
    pub process_priority: i32,
    /// Classification tag.
    pub class: AppClass,
    /// Listening descriptor, [`UNBOUND_LISTEN_FD`] until bound.
    pub listen_fd: RawFd,
    /// Socket path, for Unix-domain applications.
    pub socket_path: Option<PathBuf>,
    /// Address the application listens on.
    pub socket_address: Option<SocketAddress>,
    procs: Box<[ProcessSlot]>,
}

impl ServerRecord {
    /// A record for `fs_path` with built-in defaults.
    #[must_use]
    pub fn new(fs_path: impl Into<PathBuf>) -> Self {
        Self::with_defaults(fs_path, &ServerDefaults::default())
    }

    /// A record for `fs_path` with the given defaults.
    #[must_use]
    pub fn with_defaults(fs_path: impl Into<PathBuf>, defaults: &ServerDefaults) -> Self {
        Self {
            fs_path: fs_path.into(),
            identity: None,
            listen_queue_depth: defaults.listen_queue_depth,
            app_connect_timeout: defaults.app_connect_timeout,
            init_start_delay: defaults.init_start_delay,
            restart_delay: defaults.restart_delay,
            restart_on_exit: false,
            process_priority: defaults.process_priority,
            class: AppClass::Unknown,
            listen_fd: UNBOUND_LISTEN_FD,
            socket_path: None,
            socket_address: None,
            procs: Box::default(),
        }
    }

    /// The executable path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.fs_path
    }

    /// Uid under privilege separation.
    #[must_use]
    pub fn uid(&self) -> Option<libc::uid_t> {
        self.identity.as_ref().map(|id| id.uid)
    }

    /// Gid under privilege separation.
    #[must_use]
    pub fn gid(&self) -> Option<libc::gid_t> {
        self.identity.as_ref().map(|id| id.gid)
    }

    /// User name under privilege separation.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.identity.as_ref().map(|id| id.user.as_str())
    }

    /// Group name under privilege separation.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.identity.as_ref().map(|id| id.group.as_str())
    }

    /// Whether a listening descriptor has been assigned.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.listen_fd != UNBOUND_LISTEN_FD
    }

    /// Create the process table with `count` ready slots, replacing any
    /// previous one.
    pub fn allocate_processes(&mut self, count: usize) {
        self.procs = allocate_process_table(count);
    }

    /// The process table.
    #[must_use]
    pub fn processes(&self) -> &[ProcessSlot] {
        &self.procs
    }

    /// Mutable access to the slots. The table cannot be resized through it.
    pub fn processes_mut(&mut self) -> &mut [ProcessSlot] {
        &mut self.procs
    }

    /// Number of slots whose process was started and not yet selected for
    /// termination.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.procs
            .iter()
            .filter(|slot| slot.state() == ProcessState::Started)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::Pid;

    use super::*;

    #[test]
    fn new_record_defaults() {
        let record = ServerRecord::new("/srv/app");
        assert_eq!(record.path(), Path::new("/srv/app"));
        assert_eq!(record.listen_queue_depth, 100);
        assert_eq!(record.app_connect_timeout, Duration::ZERO);
        assert_eq!(record.init_start_delay, Duration::from_secs(1));
        assert_eq!(record.restart_delay, Duration::from_secs(5));
        assert!(!record.restart_on_exit);
        assert_eq!(record.process_priority, 0);
        assert_eq!(record.class, AppClass::Unknown);
        assert_eq!(record.listen_fd, -2);
        assert!(!record.is_bound());
        assert!(record.identity.is_none());
        assert!(record.processes().is_empty());
    }

    #[test]
    fn custom_defaults_are_applied() {
        let defaults = ServerDefaults {
            listen_queue_depth: 8,
            process_priority: 3,
            ..ServerDefaults::default()
        };
        let record = ServerRecord::with_defaults("/srv/app", &defaults);
        assert_eq!(record.listen_queue_depth, 8);
        assert_eq!(record.process_priority, 3);
    }

    #[test]
    fn process_table_is_owned_by_record() {
        let mut record = ServerRecord::new("/srv/app");
        record.allocate_processes(3);
        assert_eq!(record.processes().len(), 3);
        assert_eq!(record.running_count(), 0);

        record.processes_mut()[1].start(Pid::from_raw(99));
        assert_eq!(record.running_count(), 1);
        record.processes_mut()[1].mark_victim();
        assert_eq!(record.running_count(), 0);
    }
}
