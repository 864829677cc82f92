//! A growable memory-mapped region shared between cooperating processes on one host,
//! with a small fixed header (region type tag, layout version, `used`/`allocated`
//! byte counts) and an embedded cross-process mutex guarding everything past the
//! header.
//!
//! This is deliberately narrow: it knows nothing about what lives past the header. The
//! `monitor` crate layers an append-only element store on top of it.

mod mutex;
mod region;

pub use mutex::MutexOutcome;
pub use region::{Region, RegionGuard, RegionHeader, HEADER_LEN, NATURAL_ALIGNMENT};

/// Rounds `n` up to the nearest multiple of [`NATURAL_ALIGNMENT`].
pub fn align(n: usize) -> usize {
    (n + NATURAL_ALIGNMENT - 1) & !(NATURAL_ALIGNMENT - 1)
}

#[derive(thiserror::Error, Debug)]
pub enum ShmemError {
    #[error("failed to map shared region {name:?}: {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("platform does not support in-place remap of shared region {name:?}")]
    RemapUnsupported { name: String },
    #[error("shared region {name:?} layout version mismatch: on-disk {on_disk}, expected {expected}")]
    VersionMismatch {
        name: String,
        on_disk: u32,
        expected: u32,
    },
    #[error("shared region mutex is unrecoverably corrupted: {0}")]
    MutexCorruption(String),
}
