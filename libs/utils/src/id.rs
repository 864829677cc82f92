//! Identity newtypes used throughout the monitoring subsystem.

use std::fmt;

/// An operating-system process id, as returned by the platform's liveness oracle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// The id of the calling process.
    pub fn current() -> Self {
        ProcessId(std::process::id())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

/// Disambiguates multiple attachments of the same process to the same database. Scoped
/// to one process: two different processes may both be using `LocalId(0)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u32);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing source of [`LocalId`] values for one process's
/// attachments.
#[derive(Default)]
pub struct LocalIdGenerator {
    next: std::sync::atomic::AtomicU32,
}

impl LocalIdGenerator {
    pub fn next(&self) -> LocalId {
        LocalId(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}
