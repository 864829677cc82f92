//! Cross-process database monitoring snapshot subsystem.
//!
//! Every attached process publishes its own runtime telemetry (attachments,
//! transactions, prepared statements, call stacks, context variables) into a
//! per-database shared-memory region ([`store`]) using a self-describing wire format
//! ([`codec`]). Querying one of the monitoring relations drives one *round*: every
//! peer is forced, via [`lock::CoordinationLock`]'s AST callback, to publish fresh data
//! before [`assembler::SnapshotAssembler`] reads the store, filters by the requesting
//! attachment's identity, and materializes row buffers for the engine's virtual-relation
//! scan.
//!
//! This crate owns none of the surrounding engine's relation metadata, transaction
//! structures, distributed lock manager, or query executor — those are consumed through
//! the narrow traits in [`model`].

pub mod assembler;
pub mod codec;
pub mod collector;
pub mod error;
pub mod ids;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod store;

pub use error::{MonitorError, MonitorResult};

/// Tunables for one database's monitoring subsystem. Every field has a default drawn
/// from spec-observed constants; callers override only what they need to, the way
/// `pageserver`/`safekeeper` layer a typed config struct over built-in defaults rather
/// than hardcoding magic numbers inline.
#[derive(Clone, Copy, Debug)]
pub struct MonitorConfig {
    /// Size (bytes) a freshly created shared region is mapped at.
    pub initial_region_size: usize,
    /// Minimum amount the region grows by when a write doesn't fit (spec §4.2
    /// "ensureSpace").
    pub growth_quantum: usize,
    /// How long the reference [`lock::ThreadedLockManager`] waits for an AST
    /// acknowledgment before logging and moving on (spec §4.4/§5 "best-effort";
    /// real distributed lock managers apply their own wait semantics).
    pub ast_wait_timeout: std::time::Duration,
    /// If true, a [`error::MonitorError::CollectorError`] raised while publishing this
    /// process's own contribution during `SnapshotAssembler` construction is logged
    /// and treated as "this process contributes nothing this round" rather than
    /// aborting the whole snapshot. AST-path collector errors are always swallowed
    /// regardless of this flag (spec §7 propagation policy); this only affects the
    /// synchronous self-publish step.
    pub tolerate_self_publish_errors: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            initial_region_size: store::StoreConfig::default().initial_size,
            growth_quantum: store::StoreConfig::default().growth_quantum,
            ast_wait_timeout: std::time::Duration::from_secs(5),
            tolerate_self_publish_errors: false,
        }
    }
}

impl MonitorConfig {
    pub fn with_initial_region_size(mut self, bytes: usize) -> Self {
        self.initial_region_size = bytes;
        self
    }

    pub fn with_growth_quantum(mut self, bytes: usize) -> Self {
        self.growth_quantum = bytes;
        self
    }

    pub fn with_ast_wait_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.ast_wait_timeout = timeout;
        self
    }

    pub fn with_tolerate_self_publish_errors(mut self, tolerate: bool) -> Self {
        self.tolerate_self_publish_errors = tolerate;
        self
    }

    pub(crate) fn store_config(&self) -> store::StoreConfig {
        store::StoreConfig {
            initial_size: self.initial_region_size,
            growth_quantum: self.growth_quantum,
        }
    }

    /// Builds the reference [`lock::ThreadedLockManager`] with this config's
    /// `ast_wait_timeout`, the way a caller wiring up the reference stack from one
    /// `MonitorConfig` is expected to.
    pub fn threaded_lock_manager(&self) -> lock::ThreadedLockManager {
        lock::ThreadedLockManager::with_ast_wait_timeout(self.ast_wait_timeout)
    }
}

/// Renders the deterministic shared-region name for a database (spec §6 "`MONITOR_FILE`
/// parameterized by a stable unique database file identifier string").
pub fn region_name(database_file_id: &str) -> String {
    format!("/dbmonitor-{database_file_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_name_is_deterministic() {
        assert_eq!(region_name("db1"), region_name("db1"));
        assert_ne!(region_name("db1"), region_name("db2"));
    }

    #[test]
    fn config_defaults_match_store_defaults() {
        let cfg = MonitorConfig::default();
        let store_cfg = cfg.store_config();
        assert_eq!(store_cfg.initial_size, store::StoreConfig::default().initial_size);
        assert_eq!(store_cfg.growth_quantum, store::StoreConfig::default().growth_quantum);
    }

    #[test]
    fn threaded_lock_manager_inherits_configured_ast_wait_timeout() {
        let cfg = MonitorConfig::default().with_ast_wait_timeout(std::time::Duration::from_millis(250));
        let manager = cfg.threaded_lock_manager();
        assert_eq!(manager.ast_wait_timeout(), std::time::Duration::from_millis(250));
    }
}
