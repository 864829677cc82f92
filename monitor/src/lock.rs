//! `CoordinationLock`: the per-database advisory lock with a blocking AST callback
//! that forces every shared holder to publish fresh data before an exclusive
//! requester proceeds (spec §4.4).
//!
//! `LockManager` is the narrow engine interface this crate consumes (spec §6); the
//! real distributed lock manager lives entirely outside this crate. [`ThreadedLockManager`]
//! is the test-facing implementation of that interface, modeling the "lock-manager-
//! supplied worker thread" the design notes (spec §9) leave language-agnostic the way
//! `safekeeper`'s `WalAcceptor` models a dedicated thread reacting to channel
//! messages: one thread per SHARED registration, woken by an `EXCLUSIVE` acquire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{MonitorError, MonitorResult};
use crate::metrics::MonitorMetrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockHandle(u64);

impl LockHandle {
    /// Constructs a handle from a raw id. Exposed for [`LockManager`] implementations
    /// outside this module (the reference mock and tests in other crate modules);
    /// [`ThreadedLockManager`] itself still mints ids through its own counter.
    pub fn from_raw(id: u64) -> LockHandle {
        LockHandle(id)
    }
}

/// Callback fired on a SHARED holder when an EXCLUSIVE request arrives. Must be
/// short, idempotent under its own reentrancy flag, and must never itself call back
/// into the lock manager beyond releasing its own shared lock (spec §5).
pub type AstCallback = Box<dyn Fn() + Send + 'static>;

/// Engine interface consumed, not implemented, by the production path (spec §6
/// "Lock manager: acquire(name, mode, wait, ast_cb) -> handle, release(handle)").
pub trait LockManager: Send + Sync {
    fn acquire(
        &self,
        name: &str,
        mode: LockMode,
        wait: bool,
        ast: Option<AstCallback>,
    ) -> MonitorResult<LockHandle>;

    fn release(&self, handle: LockHandle);
}

/// One attachment's side of the coordination protocol for one database (spec §4.4).
///
/// State machine: `register` puts this attachment in `Shared-held`; an incoming AST
/// moves it through `Refreshing` (inside [`CoordinationLock::run_ast`]) to `Off`
/// (`MONITOR_OFF` set); the next `register` call moves it back to `Shared-held`.
pub struct CoordinationLock {
    name: String,
    manager: Arc<dyn LockManager>,
    monitor_off: AtomicBool,
    /// Local exclusive latch over the refresh-and-release sequence, so a reentrant
    /// AST double-checks `monitor_off` under the same serialization the first one
    /// used rather than racing it.
    publish_latch: Mutex<()>,
    shared_handle: Mutex<Option<LockHandle>>,
    /// The attachment's "run Collector, write a fresh contribution" step, set by
    /// `register` and invoked by an incoming AST fired at this attachment. The
    /// requester's own up-front refresh (spec §4.6 step 3) bypasses this field
    /// entirely and calls `Collector` directly, then uses `release_self` for the
    /// bookkeeping — see [`CoordinationLock::release_self`].
    publish: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    /// Bumped when an AST-triggered publish panics (spec §7 `CollectorError` on the
    /// AST path). Set after construction via [`CoordinationLock::with_metrics`] since
    /// the real lock manager constructs one `CoordinationLock` per attachment well
    /// before any particular snapshot round's `MonitorMetrics` instance exists.
    metrics: Mutex<Option<MonitorMetrics>>,
}

impl CoordinationLock {
    pub fn new(name: impl Into<String>, manager: Arc<dyn LockManager>) -> Arc<CoordinationLock> {
        Arc::new(CoordinationLock {
            name: name.into(),
            manager,
            monitor_off: AtomicBool::new(true),
            publish_latch: Mutex::new(()),
            shared_handle: Mutex::new(None),
            publish: Mutex::new(None),
            metrics: Mutex::new(None),
        })
    }

    /// Attaches a [`MonitorMetrics`] instance so `run_ast` can record AST failures
    /// against it. Builder-style so callers can write
    /// `CoordinationLock::new(name, manager).with_metrics(metrics)`.
    pub fn with_metrics(self: Arc<Self>, metrics: MonitorMetrics) -> Arc<Self> {
        *self.metrics.lock() = Some(metrics);
        self
    }

    /// Acquires the lock in SHARED mode and registers a blocking AST that calls
    /// `publish` (the attachment's "run Collector, write a fresh contribution"
    /// step) before releasing the shared lock and setting `MONITOR_OFF`.
    pub fn register(
        self: &Arc<Self>,
        publish: impl Fn() + Send + Sync + 'static,
    ) -> MonitorResult<()> {
        let publish: Arc<dyn Fn() + Send + Sync> = Arc::new(publish);
        *self.publish.lock() = Some(Arc::clone(&publish));

        let this = Arc::clone(self);
        let ast: AstCallback = Box::new(move || this.run_ast());
        let handle = self.manager.acquire(&self.name, LockMode::Shared, true, Some(ast))?;
        *self.shared_handle.lock() = Some(handle);
        self.monitor_off.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Acquires the lock EXCLUSIVE with wait, then immediately releases it. This is
    /// the side that *triggers* ASTs on every peer currently registered SHARED; by
    /// the time this call returns, every live peer has had a local exclusive window
    /// to publish since the request arrived (spec §5 "Ordering guarantees").
    pub fn request_snapshot(&self) -> MonitorResult<()> {
        let handle = self.manager.acquire(&self.name, LockMode::Exclusive, true, None)?;
        self.manager.release(handle);
        Ok(())
    }

    /// Releases this attachment's own shared lock and marks it `MONITOR_OFF`, without
    /// invoking the registered publish closure (spec §4.6 step 3: the requester
    /// publishes its fresh contribution directly through `Collector`, then just needs
    /// the bookkeeping release so it's positioned to receive an AST on some future
    /// round). Unlike [`CoordinationLock::run_ast`], this is unconditional — the
    /// requester is *always* about to read the store and must not skip its own
    /// refresh just because `MONITOR_OFF` happens to already be set.
    pub fn release_self(&self) {
        let _guard = self.publish_latch.lock();
        if let Some(handle) = self.shared_handle.lock().take() {
            self.manager.release(handle);
        }
        self.monitor_off.store(true, Ordering::SeqCst);
    }

    /// Runs on whatever thread the lock manager fires ASTs on. Reentrancy-safe: a
    /// peer that has already refreshed this cycle (`MONITOR_OFF` already set) no-ops
    /// under the latch rather than publishing twice.
    fn run_ast(&self) {
        let _guard = self.publish_latch.lock();
        if self.monitor_off.load(Ordering::SeqCst) {
            return;
        }

        let publish = self.publish.lock().clone();
        if let Some(publish) = publish {
            if let Err(_panic) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| publish()))
            {
                tracing::error!(database = %self.name, "AST publish callback panicked, swallowing");
                if let Some(metrics) = self.metrics.lock().as_ref() {
                    metrics.ast_failures_total.inc();
                }
            }
        }

        if let Some(handle) = self.shared_handle.lock().take() {
            self.manager.release(handle);
        }
        self.monitor_off.store(true, Ordering::SeqCst);
    }

    pub fn is_refreshing_off(&self) -> bool {
        self.monitor_off.load(Ordering::SeqCst)
    }
}

struct AstRequest {
    ack: mpsc::Sender<()>,
}

struct Registration {
    tx: mpsc::Sender<AstRequest>,
}

#[derive(Default)]
struct ThreadedInner {
    next_handle: u64,
    registrations: HashMap<u64, Registration>,
}

/// Test/reference [`LockManager`] standing in for the real distributed lock
/// manager. Each SHARED registration gets a dedicated OS thread (mirroring
/// `safekeeper::receive_wal::WalAcceptor`'s one-thread-per-connection shape); an
/// EXCLUSIVE acquire fans an AST request out to every currently registered thread
/// and waits (bounded by `ast_wait_timeout`) for each to acknowledge completion
/// before returning, which is exactly the "WAIT" semantics spec §4.4 calls for.
pub struct ThreadedLockManager {
    inner: Mutex<ThreadedInner>,
    ast_wait_timeout: Duration,
}

impl ThreadedLockManager {
    pub fn new() -> Self {
        ThreadedLockManager {
            inner: Mutex::new(ThreadedInner::default()),
            ast_wait_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_ast_wait_timeout(ast_wait_timeout: Duration) -> Self {
        ThreadedLockManager {
            inner: Mutex::new(ThreadedInner::default()),
            ast_wait_timeout,
        }
    }

    pub fn ast_wait_timeout(&self) -> Duration {
        self.ast_wait_timeout
    }

    pub fn registered_count(&self) -> usize {
        self.inner.lock().registrations.len()
    }
}

impl Default for ThreadedLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager for ThreadedLockManager {
    fn acquire(
        &self,
        _name: &str,
        mode: LockMode,
        _wait: bool,
        ast: Option<AstCallback>,
    ) -> MonitorResult<LockHandle> {
        match mode {
            LockMode::Shared => {
                let ast = ast.ok_or_else(|| {
                    MonitorError::CollectorError(anyhow::anyhow!(
                        "shared registration requires an AST callback"
                    ))
                })?;
                let (tx, rx) = mpsc::channel::<AstRequest>();
                let handle = {
                    let mut inner = self.inner.lock();
                    let handle = inner.next_handle;
                    inner.next_handle += 1;
                    inner.registrations.insert(handle, Registration { tx });
                    handle
                };

                thread::spawn(move || {
                    while let Ok(request) = rx.recv() {
                        ast();
                        let _ = request.ack.send(());
                    }
                });

                Ok(LockHandle(handle))
            }
            LockMode::Exclusive => {
                let holders: Vec<mpsc::Sender<AstRequest>> = {
                    let inner = self.inner.lock();
                    inner.registrations.values().map(|r| r.tx.clone()).collect()
                };

                for tx in holders {
                    let (ack_tx, ack_rx) = mpsc::channel();
                    if tx.send(AstRequest { ack: ack_tx }).is_ok() {
                        if ack_rx.recv_timeout(self.ast_wait_timeout).is_err() {
                            tracing::warn!("AST acknowledgment timed out; continuing round");
                        }
                    }
                }

                let handle = {
                    let mut inner = self.inner.lock();
                    let handle = inner.next_handle;
                    inner.next_handle += 1;
                    handle
                };
                Ok(LockHandle(handle))
            }
        }
    }

    fn release(&self, handle: LockHandle) {
        self.inner.lock().registrations.remove(&handle.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn exclusive_request_fires_ast_on_registered_peer() {
        let manager = Arc::new(ThreadedLockManager::new());
        let lock = CoordinationLock::new("db1", manager.clone());

        let publish_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&publish_count);
        lock.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(!lock.is_refreshing_off());
        lock.request_snapshot().unwrap();

        assert_eq!(publish_count.load(Ordering::SeqCst), 1);
        assert!(lock.is_refreshing_off());
        assert_eq!(manager.registered_count(), 0);
    }

    #[test]
    fn second_snapshot_without_reregistering_does_not_republish() {
        let manager = Arc::new(ThreadedLockManager::new());
        let lock = CoordinationLock::new("db1", manager.clone());

        let publish_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&publish_count);
        lock.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        lock.request_snapshot().unwrap();
        // The peer already released its shared lock and is no longer registered, so
        // a second exclusive round has nobody left to fire an AST at.
        lock.request_snapshot().unwrap();

        assert_eq!(publish_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_ast_callback_is_swallowed() {
        let manager = Arc::new(ThreadedLockManager::new());
        let lock = CoordinationLock::new("db1", manager);

        lock.register(|| panic!("collector exploded")).unwrap();
        lock.request_snapshot().unwrap();
        assert!(lock.is_refreshing_off());
    }

    #[test]
    fn panicking_ast_callback_bumps_ast_failures_metric() {
        let manager = Arc::new(ThreadedLockManager::new());
        let metrics = crate::metrics::MonitorMetrics::default();
        let lock = CoordinationLock::new("db1", manager).with_metrics(metrics.clone());

        lock.register(|| panic!("collector exploded")).unwrap();
        lock.request_snapshot().unwrap();

        assert_eq!(metrics.ast_failures_total.get(), 1);
    }

    #[test]
    fn release_self_does_not_invoke_the_registered_publish_closure() {
        let manager = Arc::new(ThreadedLockManager::new());
        let lock = CoordinationLock::new("db1", manager.clone());

        let publish_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&publish_count);
        lock.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        lock.release_self();
        assert_eq!(publish_count.load(Ordering::SeqCst), 0);
        assert!(lock.is_refreshing_off());

        // The requester's own registration already released itself above, so its
        // follow-up exclusive request has nobody left registered to fire an AST at.
        lock.request_snapshot().unwrap();
        assert_eq!(publish_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reregistering_resets_monitor_off() {
        let manager = Arc::new(ThreadedLockManager::new());
        let lock = CoordinationLock::new("db1", manager);

        lock.register(|| {}).unwrap();
        lock.request_snapshot().unwrap();
        assert!(lock.is_refreshing_off());

        lock.register(|| {}).unwrap();
        assert!(!lock.is_refreshing_off());
    }
}
