use std::ffi::CString;
use std::mem::MaybeUninit;
use std::num::NonZeroUsize;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::{debug, warn};

use crate::mutex::RawMutex;
use crate::{ShmemError, align};

/// Sentinel written into [`RegionHeader::region_type`] while a region is mid-init, so
/// that a concurrent opener knows to wait rather than read a half-initialized header.
const INITIALIZING: u32 = 0;

/// Sentinel meaning "some other process won the race to initialize and is still in
/// the middle of it"; openers that observe this spin until it changes.
const MID_INIT: u32 = u32::MAX;

/// Fixed prefix of the region: region type tag, layout version, `used`/`allocated`
/// byte counts, and the embedded cross-process mutex. Everything after this header is
/// owned by the layer built on top (`monitor::store`).
#[repr(C)]
pub struct RegionHeader {
    region_type: AtomicU32,
    layout_version: AtomicU32,
    used: AtomicU32,
    allocated: AtomicU32,
    mutex: MaybeUninit<RawMutex>,
}

pub const HEADER_LEN: usize = {
    let raw = std::mem::size_of::<RegionHeader>();
    (raw + NATURAL_ALIGNMENT - 1) & !(NATURAL_ALIGNMENT - 1)
};

/// The platform's natural alignment; every offset into the region is rounded up to a
/// multiple of this.
pub const NATURAL_ALIGNMENT: usize = std::mem::align_of::<u64>();

/// An attached, memory-mapped region. Owns the mapping and the backing file
/// descriptor; both are released on `Drop`/`unmap`.
pub struct Region {
    name: String,
    fd: RawFd,
    ptr: std::ptr::NonNull<u8>,
    mapped_len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Attaches to (creating if necessary) the region named `name`. The first process
    /// to create the region stamps `region_type`/`layout_version` and zeroes
    /// `used`/`allocated`; every later opener validates `layout_version` matches.
    pub fn map(
        name: &str,
        initial_size: usize,
        region_type: u32,
        layout_version: u32,
    ) -> Result<Region, ShmemError> {
        let initial_size = align(initial_size.max(HEADER_LEN));
        let cname = CString::new(name).expect("region name must not contain NUL");

        let flags = OFlag::O_CREAT | OFlag::O_RDWR;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let fd = shm_open(&cname, flags, mode).map_err(|e| ShmemError::Map {
            name: name.to_string(),
            source: std::io::Error::from(e),
        })?;

        let current_len = nix::sys::stat::fstat(fd)
            .map(|st| st.st_size as usize)
            .unwrap_or(0);
        if current_len < initial_size {
            ftruncate(fd, initial_size as i64).map_err(|e| ShmemError::Map {
                name: name.to_string(),
                source: std::io::Error::from(e),
            })?;
        }
        let mapped_len = current_len.max(initial_size);

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(mapped_len).expect("region size must be non-zero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| ShmemError::Map {
            name: name.to_string(),
            source: std::io::Error::from(e),
        })?;

        let ptr = std::ptr::NonNull::new(ptr.cast::<u8>()).expect("mmap returned null");

        let region = Region {
            name: name.to_string(),
            fd,
            ptr,
            mapped_len,
        };

        region.initialize_or_validate(region_type, layout_version, initial_size)?;
        Ok(region)
    }

    fn header(&self) -> &RegionHeader {
        unsafe { self.ptr.cast::<RegionHeader>().as_ref() }
    }

    fn initialize_or_validate(
        &self,
        region_type: u32,
        layout_version: u32,
        initial_size: usize,
    ) -> Result<(), ShmemError> {
        let header = self.header();

        match header.region_type.compare_exchange(
            INITIALIZING,
            MID_INIT,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                // We are the creator: mutex is not yet initialized by anyone, in-place
                // init it, then stamp the header and publish region_type last.
                debug!(region = %self.name, "initializing shared monitor region");
                let header_ptr = self.ptr.cast::<RegionHeader>().as_ptr();
                let place = unsafe { std::ptr::addr_of_mut!((*header_ptr).mutex) };
                unsafe { RawMutex::init_in_place(place) };

                header.layout_version.store(layout_version, Ordering::SeqCst);
                header.used.store(HEADER_LEN as u32, Ordering::SeqCst);
                header.allocated.store(initial_size as u32, Ordering::SeqCst);
                header.region_type.store(region_type, Ordering::SeqCst);
                Ok(())
            }
            Err(MID_INIT) => {
                // Another process is mid-initialization: spin until it publishes the
                // final region_type.
                for _ in 0..10_000 {
                    let rt = header.region_type.load(Ordering::SeqCst);
                    if rt != INITIALIZING && rt != MID_INIT {
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_micros(100));
                }
                self.validate_layout_version(layout_version)
            }
            Err(_already_initialized) => self.validate_layout_version(layout_version),
        }
    }

    fn validate_layout_version(&self, expected: u32) -> Result<(), ShmemError> {
        let on_disk = self.header().layout_version.load(Ordering::SeqCst);
        if on_disk != expected {
            return Err(ShmemError::VersionMismatch {
                name: self.name.clone(),
                on_disk,
                expected,
            });
        }
        Ok(())
    }

    /// Bytes currently occupied, header included.
    pub fn used(&self) -> usize {
        self.header().used.load(Ordering::SeqCst) as usize
    }

    pub fn set_used(&self, used: usize) {
        self.header().used.store(used as u32, Ordering::SeqCst);
    }

    /// Bytes currently backing the mapping, as last published in the header. May be
    /// larger than this process's own `mapped_len()` if a peer grew the region first.
    pub fn allocated(&self) -> usize {
        self.header().allocated.load(Ordering::SeqCst) as usize
    }

    fn set_allocated(&self, allocated: usize) {
        self.header().allocated.store(allocated as u32, Ordering::SeqCst);
    }

    /// Length of this process's own mapping. Callers must compare against
    /// [`Region::allocated`] and call [`Region::remap`] if it has fallen behind.
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    /// Grows (or, in principle, shrinks) the mapping to `new_size`, preserving file
    /// contents since the mapping is file-backed. `preserve` exists for API symmetry
    /// with the design spec; for this file-backed implementation content is always
    /// preserved across a remap.
    pub fn remap(&mut self, new_size: usize, preserve: bool) -> Result<(), ShmemError> {
        let new_size = align(new_size);
        let _ = preserve;

        ftruncate(self.fd, new_size as i64).map_err(|_| ShmemError::RemapUnsupported {
            name: self.name.clone(),
        })?;

        let new_ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(new_size).expect("remap size must be non-zero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.fd,
                0,
            )
        }
        .map_err(|_| ShmemError::RemapUnsupported {
            name: self.name.clone(),
        })?;

        unsafe { munmap(self.ptr.as_ptr().cast(), self.mapped_len) }.ok();

        self.ptr = std::ptr::NonNull::new(new_ptr.cast::<u8>()).expect("mmap returned null");
        self.mapped_len = new_size;
        if new_size > self.header().allocated.load(Ordering::SeqCst) as usize {
            self.set_allocated(new_size);
        }
        Ok(())
    }

    /// Locks the embedded mutex, returning a guard that derefs to the element storage
    /// area (everything past [`HEADER_LEN`]).
    pub fn lock(&self) -> Result<RegionGuard<'_>, ShmemError> {
        match self.header().mutex_ref().lock() {
            Ok(outcome) => {
                if outcome == crate::MutexOutcome::RecoveredFromDeadOwner {
                    warn!(region = %self.name, "recovered monitor region mutex from a dead process");
                }
                Ok(RegionGuard { region: self })
            }
            Err(errno) => Err(ShmemError::MutexCorruption(format!(
                "pthread_mutex_lock returned errno {errno}"
            ))),
        }
    }

    /// Unmaps this process's view of the region. The underlying file (and any other
    /// process's mapping of it) is untouched; use [`Region::remove`] to delete it.
    pub fn unmap(self) {
        drop(self)
    }

    /// Removes the backing shared-memory object by name. Safe to call even if other
    /// processes still have it mapped (POSIX shm semantics keep their mappings valid
    /// until they unmap).
    pub fn remove(name: &str) -> Result<(), ShmemError> {
        let cname = CString::new(name).expect("region name must not contain NUL");
        shm_unlink(&cname).map_err(|e| ShmemError::Map {
            name: name.to_string(),
            source: std::io::Error::from(e),
        })
    }
}

impl RegionHeader {
    fn mutex_ref(&self) -> &RawMutex {
        unsafe { self.mutex.assume_init_ref() }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { munmap(self.ptr.as_ptr().cast(), self.mapped_len) }.ok();
        unsafe { libc::close(self.fd) };
    }
}

/// RAII guard over a locked [`Region`]. Derefs to the element storage bytes (the
/// region's mapping, minus the header).
pub struct RegionGuard<'a> {
    region: &'a Region,
}

impl<'a> RegionGuard<'a> {
    pub fn used(&self) -> usize {
        self.region.used()
    }

    pub fn set_used(&self, used: usize) {
        self.region.set_used(used)
    }

    pub fn allocated(&self) -> usize {
        self.region.allocated()
    }

    pub fn mapped_len(&self) -> usize {
        self.region.mapped_len()
    }

    /// Raw bytes of the whole mapping, header included. Element-store code is
    /// expected to offset past [`HEADER_LEN`] itself, since element offsets are
    /// defined relative to the start of the region in the design spec.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.region.ptr.as_ptr(), self.region.mapped_len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.region.ptr.as_ptr(), self.region.mapped_len) }
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.region.header().mutex_ref().unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!(
            "/shmem-test-{tag}-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        )
    }

    #[test]
    fn map_initializes_header_once() {
        let name = unique_name("init");
        let region = Region::map(&name, 4096, 0xABCD, 1).unwrap();
        assert_eq!(region.used(), HEADER_LEN);
        assert!(region.allocated() >= 4096);
        Region::remove(&name).unwrap();
    }

    #[test]
    fn second_open_validates_layout_version() {
        let name = unique_name("version");
        let region = Region::map(&name, 4096, 0xABCD, 7).unwrap();
        let reopened = Region::map(&name, 4096, 0xABCD, 7).unwrap();
        assert_eq!(reopened.used(), region.used());

        let err = Region::map(&name, 4096, 0xABCD, 8).unwrap_err();
        assert!(matches!(err, ShmemError::VersionMismatch { .. }));

        drop(region);
        drop(reopened);
        Region::remove(&name).unwrap();
    }

    #[test]
    fn remap_preserves_contents_and_grows_allocated() {
        let name = unique_name("remap");
        let mut region = Region::map(&name, 4096, 1, 1).unwrap();
        {
            let mut guard = region.lock().unwrap();
            guard.as_mut_slice()[HEADER_LEN] = 0x42;
        }
        region.remap(16384, true).unwrap();
        assert!(region.allocated() >= 16384);
        assert!(region.mapped_len() >= 16384);
        {
            let guard = region.lock().unwrap();
            assert_eq!(guard.as_slice()[HEADER_LEN], 0x42);
        }
        Region::remove(&name).unwrap();
    }

    #[test]
    fn lock_is_mutually_exclusive_within_process() {
        let name = unique_name("lock");
        let region = Region::map(&name, 4096, 1, 1).unwrap();
        {
            let _g = region.lock().unwrap();
            // Nested non-blocking attempt would deadlock here; we only assert the
            // guard releases cleanly on drop.
        }
        let _g2 = region.lock().unwrap();
        Region::remove(&name).unwrap();
    }
}
