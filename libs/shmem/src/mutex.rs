//! Cross-process mutex embedded in shared memory.
//!
//! Grounded on the `pthread_mutex_t` + `PTHREAD_PROCESS_SHARED` pattern used by
//! shared-memory IPC crates in this ecosystem: the mutex lives inside the mapped
//! region itself (not in process-private memory), so any process that maps the region
//! can lock it. `PTHREAD_MUTEX_ROBUST` lets a subsequent locker recover from a holder
//! that died mid-section instead of wedging forever.

use std::mem::MaybeUninit;

use tracing::warn;

/// Outcome of a successful `lock()` call.
#[derive(Debug, PartialEq, Eq)]
pub enum MutexOutcome {
    /// Acquired cleanly.
    Clean,
    /// The previous holder died while holding the mutex; state was marked consistent.
    RecoveredFromDeadOwner,
}

/// Wrapper around a `pthread_mutex_t` that lives at a fixed address inside shared
/// memory. Must be initialized exactly once, by whichever process creates the region.
#[repr(transparent)]
pub struct RawMutex(libc::pthread_mutex_t);

impl RawMutex {
    /// Initializes a `pthread_mutex_t` in place at `place`, configured for
    /// cross-process, robust use. Must be called exactly once per region, by the
    /// creating process, before any other process attaches.
    ///
    /// # Safety
    /// `place` must point at valid, exclusively-owned memory for the lifetime of the
    /// region, and must not already hold an initialized mutex.
    pub unsafe fn init_in_place(place: *mut MaybeUninit<RawMutex>) {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
        assert_eq!(rc, 0, "pthread_mutexattr_init failed: {rc}");
        let mut attr = attr.assume_init();

        let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        assert_eq!(rc, 0, "pthread_mutexattr_setpshared failed: {rc}");

        let rc = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
        assert_eq!(rc, 0, "pthread_mutexattr_setrobust failed: {rc}");

        let mutex_ptr = (*place).as_mut_ptr().cast::<libc::pthread_mutex_t>();
        let rc = libc::pthread_mutex_init(mutex_ptr, &attr);
        assert_eq!(rc, 0, "pthread_mutex_init failed: {rc}");

        libc::pthread_mutexattr_destroy(&mut attr);
    }

    /// Locks the mutex, blocking the calling thread.
    ///
    /// `Ok(MutexOutcome::RecoveredFromDeadOwner)` means the previous holder's process
    /// died while holding the lock; the caller now holds a consistent, valid lock and
    /// should treat whatever it protects as possibly partially updated. Any other
    /// error means the mutex itself is unrecoverable (`EINVAL`, `ENOTRECOVERABLE`) and
    /// the caller must terminate the process rather than continue, per the monitoring
    /// subsystem's mutex-corruption policy.
    pub fn lock(&self) -> Result<MutexOutcome, i32> {
        let rc = unsafe { libc::pthread_mutex_lock(self.as_ptr()) };
        match rc {
            0 => Ok(MutexOutcome::Clean),
            libc::EOWNERDEAD => {
                warn!("recovering monitor region mutex from a dead holder");
                let rc = unsafe { libc::pthread_mutex_consistent(self.as_ptr()) };
                if rc != 0 {
                    return Err(rc);
                }
                Ok(MutexOutcome::RecoveredFromDeadOwner)
            }
            other => Err(other),
        }
    }

    pub fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.as_ptr()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed: {rc}");
    }

    fn as_ptr(&self) -> *mut libc::pthread_mutex_t {
        &self.0 as *const _ as *mut _
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    #[test]
    fn lock_unlock_roundtrip() {
        let mut place: MaybeUninit<RawMutex> = MaybeUninit::uninit();
        unsafe { RawMutex::init_in_place(&mut place) };
        let m = unsafe { place.assume_init() };

        assert_eq!(m.lock().unwrap(), MutexOutcome::Clean);
        m.unlock();
        assert_eq!(m.lock().unwrap(), MutexOutcome::Clean);
        m.unlock();
    }
}
