//! Process table allocation.
//!
//! Every server record owns a fixed-size table of [`ProcessSlot`]s, one per
//! worker process the supervisor may run for it. The table is created once
//! and never resized.

use nix::unistd::Pid;

/// Lifecycle state of a worker process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessState {
    /// Slot is free and may be (re)started.
    #[default]
    Ready,
    /// A process was started and is believed to be running.
    Started,
    /// Selected for termination.
    Victim,
    /// Termination signal has been sent.
    Killed,
}

/// One worker process backing a server record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessSlot {
    pid: Option<Pid>,
    state: ProcessState,
}

impl ProcessSlot {
    /// Raw process id, `0` when the slot is unoccupied.
    #[must_use]
    pub fn pid(&self) -> libc::pid_t {
        self.pid.map_or(0, Pid::as_raw)
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    /// Whether no process currently occupies this slot.
    #[must_use]
    pub const fn is_vacant(&self) -> bool {
        self.pid.is_none()
    }

    /// Record that `pid` was started in this slot.
    pub fn start(&mut self, pid: Pid) {
        self.pid = Some(pid);
        self.state = ProcessState::Started;
    }

    /// Select the running process for termination.
    pub fn mark_victim(&mut self) {
        self.state = ProcessState::Victim;
    }

    /// Record that the termination signal was delivered.
    pub fn mark_killed(&mut self) {
        self.state = ProcessState::Killed;
    }

    /// Return the slot to its allocation state after the process was reaped.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Allocate a process table of exactly `count` slots.
///
/// Every slot starts with pid `0` and state [`ProcessState::Ready`]. Failure
/// to obtain memory aborts the process; a partially sized table is never
/// returned.
#[must_use]
pub fn allocate_process_table(count: usize) -> Box<[ProcessSlot]> {
    vec![ProcessSlot::default(); count].into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_exact_count_in_ready_state() {
        let table = allocate_process_table(5);
        assert_eq!(table.len(), 5);
        for slot in table.iter() {
            assert_eq!(slot.pid(), 0);
            assert_eq!(slot.state(), ProcessState::Ready);
            assert!(slot.is_vacant());
        }
    }

    #[test]
    fn empty_table() {
        assert!(allocate_process_table(0).is_empty());
    }

    #[test]
    fn slot_lifecycle() {
        let mut table = allocate_process_table(2);
        table[0].start(Pid::from_raw(4242));
        assert_eq!(table[0].pid(), 4242);
        assert_eq!(table[0].state(), ProcessState::Started);
        assert!(table[1].is_vacant(), "other slots are untouched");

        table[0].mark_victim();
        assert_eq!(table[0].state(), ProcessState::Victim);
        table[0].mark_killed();
        assert_eq!(table[0].state(), ProcessState::Killed);

        table[0].reset();
        assert_eq!(table[0], ProcessSlot::default());
    }
}
