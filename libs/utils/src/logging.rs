//! `tracing` bootstrap shared by every binary/test harness in this workspace.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber that writes to stderr and honors
/// `RUST_LOG`, falling back to `default_filter` when unset. Idempotent: calling this
/// more than once (e.g. from multiple test modules) is harmless, the second call is a
/// no-op.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
