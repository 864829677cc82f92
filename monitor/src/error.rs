//! Error taxonomy for the monitoring subsystem (spec §7).
//!
//! `MutexCorruption` is special: construction of that variant is always immediately
//! followed, at its one call site, by a logged `std::process::exit` — it never
//! propagates past [`crate::store::MonitoringStore::acquire`]. Every other variant
//! follows normal `?`-propagation up to the snapshot caller, which aborts the
//! in-progress snapshot and discards any partially populated row buffers.

#[derive(thiserror::Error, Debug)]
pub enum MonitorError {
    #[error("failed to map monitoring shared region: {0}")]
    MapFailure(#[source] shmem::ShmemError),

    #[error("monitor table exhausted (needed {needed} more bytes)")]
    RegionExhausted { needed: usize },

    #[error("monitoring region mutex corrupted: {0}")]
    MutexCorruption(String),

    #[error("collector failed: {0}")]
    CollectorError(#[source] anyhow::Error),

    #[error("malformed monitoring dump: {0}")]
    DecodeError(String),

    #[error("timed out waiting for monitor lock")]
    LockTimeout,
}

pub type MonitorResult<T> = Result<T, MonitorError>;

impl From<shmem::ShmemError> for MonitorError {
    fn from(e: shmem::ShmemError) -> Self {
        match e {
            shmem::ShmemError::MutexCorruption(msg) => MonitorError::MutexCorruption(msg),
            other => MonitorError::MapFailure(other),
        }
    }
}

// `RegionExhausted` is deliberately not reachable through the blanket `From` above:
// a `ShmemError::RemapUnsupported` only means "monitor table exhausted" when it
// surfaces from a growth attempt (`MonitoringStore::grow`, which knows `needed`).
// The same remap failure surfacing from `catch_up_mapping` (re-mapping to match a
// peer's already-published `allocated`, not growing past it) is a plain map failure.
