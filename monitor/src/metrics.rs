//! Process-local counters for the monitoring subsystem. Ambient observability, not a
//! feature the spec's Non-goals scope out: snapshot rounds taken, AST failures, and GC
//! reclamations are the three signals worth a dashboard, mirroring the shape of a
//! `prometheus`-backed metrics module (`IntCounter`/`IntGauge` behind a small registry
//! struct) rather than ad hoc atomics scattered through the code.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Counters for one process's monitoring activity across every database it
/// contributes to. Cheap to construct; callers typically keep one behind a
/// `once_cell::sync::Lazy` or hand a single instance down through `SnapshotAssembler`
/// construction.
#[derive(Clone)]
pub struct MonitorMetrics {
    /// Snapshot rounds this process has driven to completion (as the requester).
    pub snapshot_rounds_total: IntCounter,
    /// AST callbacks that ran but failed to publish (caught, logged, swallowed —
    /// spec §7 `CollectorError` on the AST path).
    pub ast_failures_total: IntCounter,
    /// Dead-process elements reclaimed across every `cleanup`/`read` call.
    pub gc_reclamations_total: IntCounter,
    /// Elements currently live in this database's store, as of the last read.
    pub live_contributions: IntGauge,
}

impl MonitorMetrics {
    pub fn new() -> anyhow::Result<MonitorMetrics> {
        let snapshot_rounds_total = IntCounter::with_opts(Opts::new(
            "monitor_snapshot_rounds_total",
            "Monitoring snapshot rounds completed by this process as the requester",
        ))?;
        let ast_failures_total = IntCounter::with_opts(Opts::new(
            "monitor_ast_failures_total",
            "AST publish callbacks that raised and were swallowed",
        ))?;
        let gc_reclamations_total = IntCounter::with_opts(Opts::new(
            "monitor_gc_reclamations_total",
            "Dead-process elements reclaimed from the monitoring store",
        ))?;
        let live_contributions = IntGauge::with_opts(Opts::new(
            "monitor_live_contributions",
            "Live per-process contributions observed in the store as of the last read",
        ))?;

        Ok(MonitorMetrics {
            snapshot_rounds_total,
            ast_failures_total,
            gc_reclamations_total,
            live_contributions,
        })
    }

    /// Registers every counter with `registry` so it shows up alongside the rest of
    /// the process's metrics. Not called by `new()` directly: a process may host
    /// several databases' worth of `MonitorMetrics` and wants to label or namespace
    /// them before registering, which this crate has no opinion about.
    pub fn register(&self, registry: &Registry) -> anyhow::Result<()> {
        registry.register(Box::new(self.snapshot_rounds_total.clone()))?;
        registry.register(Box::new(self.ast_failures_total.clone()))?;
        registry.register(Box::new(self.gc_reclamations_total.clone()))?;
        registry.register(Box::new(self.live_contributions.clone()))?;
        Ok(())
    }
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new().expect("metric options are static and well-formed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = MonitorMetrics::default();
        assert_eq!(metrics.snapshot_rounds_total.get(), 0);
        assert_eq!(metrics.ast_failures_total.get(), 0);
        assert_eq!(metrics.gc_reclamations_total.get(), 0);
        assert_eq!(metrics.live_contributions.get(), 0);
    }

    #[test]
    fn register_accepts_every_counter_once() {
        let metrics = MonitorMetrics::default();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();
        assert_eq!(registry.gather().len(), 4);
    }
}
