//! The shared backing: one POSIX shared-memory object per node.
//!
//! Layout of the object (`ftruncate`d to 3 GiB + 3 MiB + 1 page):
//!
//! ```text
//! ┌──────────────────────────────┬───────────────┬────────────────┐
//! │ deduplication store (3 GiB)  │ sharing map   │ counters page  │
//! │ page 0 = zero template (RO)  │ (3 MiB)       │ (1 page)       │
//! └──────────────────────────────┴───────────────┴────────────────┘
//! offset 0                        3 GiB           3 GiB + 3 MiB
//! ```
//!
//! File offset `k * page_size` inside the store backs window address
//! `bottom + k * page_size` in every sibling. The first page is the zero
//! template: permanently zero, mapped read-only by every process that
//! holds a zero-backed page.
//!
//! The first process to open the object (`O_CREAT|O_EXCL` succeeds) sizes
//! it and initializes the counters; later siblings attach, verify the
//! header, and take the next rank. The whole open runs under the
//! interprocess mutex so a joiner never observes a half-built header.

use crate::bitmap::{SharingMap, SlotWidth};
use crate::error::{Error, Result};
use crate::layout::{HeapWindow, SHARING_REGION_BYTES, WINDOW_BYTES};
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};
use rustix::shm::OFlags;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Prefix of the shared-memory object name; the configured key is
/// appended so distinct jobs on one node never share a backing.
pub const SHM_NAME: &str = "/pagefold-heap";

/// Identifies a pagefold backing header.
const BACKING_MAGIC: u64 = 0x5046_4C44_4845_4150; // "PFLDHEAP"

/// Bumped whenever the header or region layout changes.
const BACKING_VERSION: u32 = 1;

/// Pages charged to the shared metadata region at creation, so the
/// counters never report the bitmap's own footprint as savings.
const METADATA_RESERVATION_PAGES: i64 = 192;

/// Shared accounting state at the tail of the backing.
///
/// Mutated only under the interprocess mutex; the atomics keep loads
/// coherent across siblings.
#[repr(C)]
pub struct SharedCounters {
    magic: AtomicU64,
    version: AtomicU32,
    /// Sharing-slot width in bits (8 or 16), fixed by the creator.
    width: AtomicU32,
    /// Processes that completed init and not yet completed teardown.
    pub alive_procs: AtomicI64,
    /// Pages currently held shared by two or more siblings.
    pub shared_pages: AtomicI64,
    /// Private pages summed across all siblings.
    pub private_pages: AtomicI64,
    /// Pages the job would occupy with deduplication disabled.
    pub baseline_pages: AtomicI64,
}

/// The opened backing plus this process's identity within it.
pub struct SharedBacking {
    fd: OwnedFd,
    zero_page: NonNull<u8>,
    sharing_base: NonNull<u8>,
    state_page: NonNull<u8>,
    sharing: SharingMap,
    page_size: usize,
    name: String,
    rank: u32,
    mask: u16,
    created: bool,
    detached: std::cell::Cell<bool>,
}

impl SharedBacking {
    /// Open or create the backing named `name` and join the node.
    ///
    /// Must run under the interprocess mutex; `_guard` enforces that at
    /// the type level.
    ///
    /// # Errors
    ///
    /// Fails on shm/mmap errors, a header that does not match this build,
    /// or more joiners than the sharing map was sized for.
    pub fn open(
        name: &str,
        window: &HeapWindow,
        _guard: &crate::sem::SemGuard<'_>,
    ) -> Result<Self> {
        let page_size = window.page_size;
        let total_size = (WINDOW_BYTES + SHARING_REGION_BYTES + page_size) as u64;

        let (fd, created) = match rustix::shm::open(
            name,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        ) {
            Ok(fd) => (fd, true),
            Err(e) if e == rustix::io::Errno::EXIST => (
                rustix::shm::open(name, OFlags::RDWR, Mode::empty())?,
                false,
            ),
            Err(e) => return Err(e.into()),
        };

        if created {
            // ftruncate zero-fills the whole object, zero template included.
            rustix::fs::ftruncate(&fd, total_size)?;
        }

        let zero_prot = if created {
            ProtFlags::READ | ProtFlags::WRITE
        } else {
            ProtFlags::READ
        };
        // SAFETY: mapping the backing at a kernel-chosen address.
        let zero_ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                page_size,
                zero_prot,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let zero_page = NonNull::new(zero_ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        if created {
            // SAFETY: freshly mapped writable page of page_size bytes.
            unsafe { std::ptr::write_bytes(zero_page.as_ptr(), 0, page_size) };
            // The template must never be written again, by anyone.
            // SAFETY: protecting the mapping we just created.
            unsafe { rustix::mm::mprotect(zero_ptr, page_size, MprotectFlags::READ)? };
        }

        // SAFETY: as above; the sharing region at the end of the store.
        let sharing_ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                SHARING_REGION_BYTES,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                WINDOW_BYTES as u64,
            )?
        };
        let sharing_base = NonNull::new(sharing_ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        // SAFETY: as above; the counters page at the tail.
        let state_ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                page_size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                (WINDOW_BYTES + SHARING_REGION_BYTES) as u64,
            )?
        };
        let state_page = NonNull::new(state_ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        // SAFETY: the state page is page-aligned, zero-initialized shared
        // memory large enough for SharedCounters.
        let counters = unsafe { &*state_page.as_ptr().cast::<SharedCounters>() };

        let (rank, width) = if created {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8);
            let width = SlotWidth::for_cores(cores).unwrap_or(SlotWidth::Sixteen);

            counters.version.store(BACKING_VERSION, Ordering::Relaxed);
            counters.width.store(width.encode(), Ordering::Relaxed);
            counters.alive_procs.store(1, Ordering::Relaxed);
            // The zero template counts as the first shared page.
            counters.shared_pages.store(1, Ordering::Relaxed);
            counters
                .private_pages
                .store(METADATA_RESERVATION_PAGES, Ordering::Relaxed);
            counters.baseline_pages.store(0, Ordering::Relaxed);
            counters.magic.store(BACKING_MAGIC, Ordering::Release);
            (0u32, width)
        } else {
            if counters.magic.load(Ordering::Acquire) != BACKING_MAGIC {
                return Err(Error::BackingMismatch("bad magic".into()));
            }
            let version = counters.version.load(Ordering::Relaxed);
            if version != BACKING_VERSION {
                return Err(Error::BackingMismatch(format!(
                    "version {version}, expected {BACKING_VERSION}"
                )));
            }
            let width = SlotWidth::decode(counters.width.load(Ordering::Relaxed))
                .ok_or_else(|| Error::BackingMismatch("bad slot width".into()))?;

            let rank = counters.alive_procs.fetch_add(1, Ordering::AcqRel) as u32;
            if rank >= width.bits() {
                counters.alive_procs.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::NodeWidthExceeded {
                    rank,
                    width: width.bits(),
                });
            }
            (rank, width)
        };

        // SAFETY: the sharing region stays mapped for the life of self.
        let sharing =
            unsafe { SharingMap::from_raw(sharing_base, window.page_count(), width) };

        tracing::debug!(
            name,
            created,
            rank,
            width = width.bits(),
            "shared backing attached"
        );

        Ok(Self {
            fd,
            zero_page,
            sharing_base,
            state_page,
            sharing,
            page_size,
            name: name.to_string(),
            rank,
            mask: 1u16 << rank,
            created,
            detached: std::cell::Cell::new(false),
        })
    }

    /// Rank of this process on the node (0-based join order).
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// This process's bit in a sharing-map slot.
    pub fn mask(&self) -> u16 {
        self.mask
    }

    /// Whether this process created the backing.
    pub fn created(&self) -> bool {
        self.created
    }

    /// The sharing map over the whole window.
    pub fn sharing(&self) -> &SharingMap {
        &self.sharing
    }

    /// The shared accounting counters.
    pub fn counters(&self) -> &SharedCounters {
        // SAFETY: the state page stays mapped until detach, and detach
        // consumes the only path that hands out this reference.
        unsafe { &*self.state_page.as_ptr().cast::<SharedCounters>() }
    }

    /// The zero template as a byte slice.
    pub fn zero_template(&self) -> &[u8] {
        // SAFETY: read-only page_size mapping, live for the life of self.
        unsafe { std::slice::from_raw_parts(self.zero_page.as_ptr(), self.page_size) }
    }

    /// Map `len` bytes of the store at file offset `offset` over the fixed
    /// address `addr`, replacing whatever mapping is there.
    ///
    /// # Safety
    ///
    /// `addr` must be a page-aligned address this process owns inside the
    /// heap window; replacing the mapping must not invalidate live
    /// references.
    pub unsafe fn map_store_fixed(
        &self,
        addr: usize,
        len: usize,
        offset: u64,
        writable: bool,
    ) -> Result<()> {
        let prot = if writable {
            ProtFlags::READ | ProtFlags::WRITE
        } else {
            ProtFlags::READ
        };
        // SAFETY: caller contract.
        let ptr = unsafe {
            rustix::mm::mmap(
                addr as *mut _,
                len,
                prot,
                MapFlags::SHARED | MapFlags::FIXED,
                &self.fd,
                offset,
            )?
        };
        debug_assert_eq!(ptr as usize, addr);
        Ok(())
    }

    /// Map `len` bytes of the store at file offset `offset` at a
    /// kernel-chosen address, read-write. Used for staging copies and the
    /// merge engine's compare buffer.
    pub fn map_store_anywhere(&self, len: usize, offset: u64) -> Result<*mut u8> {
        // SAFETY: fresh mapping at a kernel-chosen address.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &self.fd,
                offset,
            )?
        };
        Ok(ptr.cast())
    }

    /// Unmap the metadata views. Counter and sharing-map accessors must
    /// not be used afterwards.
    pub fn unmap_metadata(&self) {
        if self.detached.replace(true) {
            return;
        }
        // SAFETY: unmapping the three views this struct created.
        unsafe {
            let _ = rustix::mm::munmap(self.sharing_base.as_ptr().cast(), SHARING_REGION_BYTES);
            let _ = rustix::mm::munmap(self.state_page.as_ptr().cast(), self.page_size);
            let _ = rustix::mm::munmap(self.zero_page.as_ptr().cast(), self.page_size);
        }
    }

    /// Release the last sibling's storage: shrink the object and remove
    /// its name.
    pub fn shrink_and_unlink(&self) {
        let _ = rustix::fs::ftruncate(&self.fd, 0);
        let _ = rustix::shm::unlink(&self.name);
    }
}

impl Drop for SharedBacking {
    fn drop(&mut self) {
        self.unmap_metadata();
        // fd closes when OwnedFd drops.
    }
}

// SAFETY: all shared mutation goes through atomics under the interprocess
// mutex; the raw pointers are stable mappings for the life of the value.
unsafe impl Send for SharedBacking {}
unsafe impl Sync for SharedBacking {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sem::IpcSem;

    fn test_setup(tag: &str) -> (String, String, HeapWindow) {
        let pid = std::process::id();
        (
            format!("/pagefold-test-shm-{tag}-{pid}"),
            format!("/pagefold-test-bsem-{tag}-{pid}"),
            HeapWindow::discover().unwrap(),
        )
    }

    #[test]
    fn test_create_and_join() {
        let (shm, sem_name, window) = test_setup("join");
        let sem = IpcSem::open(&sem_name).unwrap();

        let first = {
            let guard = sem.lock();
            SharedBacking::open(&shm, &window, &guard).unwrap()
        };
        assert!(first.created());
        assert_eq!(first.rank(), 0);
        assert_eq!(first.mask(), 1);
        assert_eq!(first.counters().alive_procs.load(Ordering::Relaxed), 1);
        assert_eq!(first.counters().shared_pages.load(Ordering::Relaxed), 1);

        let second = {
            let guard = sem.lock();
            SharedBacking::open(&shm, &window, &guard).unwrap()
        };
        assert!(!second.created());
        assert_eq!(second.rank(), 1);
        assert_eq!(second.mask(), 2);
        assert_eq!(second.counters().alive_procs.load(Ordering::Relaxed), 2);

        first.shrink_and_unlink();
        sem.close();
        sem.unlink();
    }

    #[test]
    fn test_zero_template_is_zero() {
        let (shm, sem_name, window) = test_setup("zero");
        let sem = IpcSem::open(&sem_name).unwrap();
        let backing = {
            let guard = sem.lock();
            SharedBacking::open(&shm, &window, &guard).unwrap()
        };

        assert!(backing.zero_template().iter().all(|&b| b == 0));
        assert_eq!(backing.zero_template().len(), window.page_size);

        backing.shrink_and_unlink();
        sem.close();
        sem.unlink();
    }

    #[test]
    fn test_sharing_map_visible_across_handles() {
        let (shm, sem_name, window) = test_setup("share");
        let sem = IpcSem::open(&sem_name).unwrap();
        let first = {
            let guard = sem.lock();
            SharedBacking::open(&shm, &window, &guard).unwrap()
        };
        let second = {
            let guard = sem.lock();
            SharedBacking::open(&shm, &window, &guard).unwrap()
        };

        first.sharing().set(42, first.mask());
        assert!(second.sharing().test(42, first.mask()));
        assert!(second.sharing().others(42, second.mask()));
        assert_eq!(second.sharing().count_sharers(42), 1);

        first.shrink_and_unlink();
        sem.close();
        sem.unlink();
    }

    #[test]
    fn test_store_mapping_round_trip() {
        let (shm, sem_name, window) = test_setup("store");
        let sem = IpcSem::open(&sem_name).unwrap();
        let backing = {
            let guard = sem.lock();
            SharedBacking::open(&shm, &window, &guard).unwrap()
        };

        let offset = (window.page_size * 10) as u64;
        let a = backing.map_store_anywhere(window.page_size, offset).unwrap();
        let b = backing.map_store_anywhere(window.page_size, offset).unwrap();
        // SAFETY: both map the same file page read-write.
        unsafe {
            *a = 0xAB;
            assert_eq!(*b, 0xAB);
            rustix::mm::munmap(a.cast(), window.page_size).unwrap();
            rustix::mm::munmap(b.cast(), window.page_size).unwrap();
        }

        backing.shrink_and_unlink();
        sem.close();
        sem.unlink();
    }
}
