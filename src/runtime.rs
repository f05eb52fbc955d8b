//! Process lifecycle and the heap singleton.
//!
//! One [`SharedHeap`] per process ties together the heap window, the
//! shared backing, the interprocess mutex, and the private bookkeeping.
//! The allocator is multi-process but single-threaded within a process:
//! mutable bookkeeping lives in an [`UnsafeCell`] and is reached through
//! [`SharedHeap::state_mut`], whose contract is that one thread per
//! process touches the allocator (the write-fault handler runs on that
//! same thread, interrupting it synchronously).

use crate::alloc::{BlockAllocator, NullBlockAllocator};
use crate::bitmap::PageBitmap;
use crate::backing::SharedBacking;
use crate::config::{Config, MergePolicy, ProfileMode};
use crate::error::{Error, Result};
use crate::layout::{read_max_map_count, HeapWindow};
use crate::policy::MergeController;
use crate::registry::AllocationRegistry;
use crate::sem::IpcSem;
use crate::stats::{PartialSimilarity, Profiler, StatsBuffer};
use rustix::mm::{MapFlags, MremapFlags, ProtFlags};
use std::cell::UnsafeCell;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;

/// Mappings held for the backing's metadata views at startup.
const INITIAL_MAP_COUNT: i64 = 3;

/// Per-process mutable bookkeeping.
pub(crate) struct HeapState {
    /// Live allocations, keyed by base address.
    pub registry: AllocationRegistry,
    /// Ever-initialized bit per window page.
    pub touched: PageBitmap,
    /// Currently-zero-backed bit per window page.
    pub zeroed: PageBitmap,
    /// Merge trigger state for the active policy.
    pub controller: MergeController,
    /// Zero-backed pages held by this process.
    pub zero_pages: i64,
    /// Estimate of this process's VMA count.
    pub map_count: i64,
    /// Kernel `vm.max_map_count`.
    pub map_ceiling: i64,
    /// Rank-0 ratchet of the node's peak baseline footprint, in pages.
    pub baseline_peak: i64,
    /// Usage-sample buffer.
    pub stats: StatsBuffer,
    /// Merge-event profile, when enabled.
    pub profiler: Option<Profiler>,
    /// Sub-page similarity histogram (diagnostic only).
    pub similarity: PartialSimilarity,
    /// Small-block allocator the surface delegates sub-page requests to.
    pub block_alloc: Box<dyn BlockAllocator>,
    /// Set once teardown has begun.
    pub finalized: bool,
}

/// The per-process face of the node-wide deduplicating heap.
pub struct SharedHeap {
    pub(crate) config: Config,
    pub(crate) window: HeapWindow,
    pub(crate) mutex: IpcSem,
    pub(crate) backing: SharedBacking,
    state: UnsafeCell<HeapState>,
}

// SAFETY: the allocator is single-threaded per process by contract
// (spelled out in the crate docs); cross-process state is reached only
// through atomics under the interprocess mutex.
unsafe impl Sync for SharedHeap {}
unsafe impl Send for SharedHeap {}

impl SharedHeap {
    /// Build the heap: discover the window, join the backing, size the
    /// bookkeeping.
    pub(crate) fn new(config: Config) -> Result<Self> {
        let window = HeapWindow::discover()?;
        probe_atomic_remap(window.page_size)?;

        let mutex = IpcSem::open(&config.sem_name())?;
        let backing = {
            let guard = mutex.lock();
            match SharedBacking::open(&config.shm_name(), &window, &guard) {
                Ok(backing) => backing,
                Err(e) => {
                    drop(guard);
                    mutex.close();
                    return Err(e);
                }
            }
        };

        let rank = backing.rank();
        let write_usage_log = rank == 0 && config.merge_policy != MergePolicy::Disabled;
        let profiler = (config.profile_mode == ProfileMode::Create)
            .then(|| Profiler::new(rank, config.enable_backtrace));

        let pages = window.page_count();
        let state = HeapState {
            registry: AllocationRegistry::new(),
            touched: PageBitmap::new(pages),
            zeroed: PageBitmap::new(pages),
            controller: MergeController::new(&config, &window),
            zero_pages: 0,
            map_count: INITIAL_MAP_COUNT,
            map_ceiling: read_max_map_count(),
            baseline_peak: 0,
            stats: StatsBuffer::new(rank, write_usage_log),
            profiler,
            similarity: PartialSimilarity::default(),
            block_alloc: Box::new(NullBlockAllocator),
            finalized: false,
        };

        tracing::debug!(
            rank,
            bottom = format_args!("{:#x}", window.bottom),
            top = format_args!("{:#x}", window.top),
            policy = ?config.merge_policy,
            "heap initialized"
        );

        Ok(Self {
            config,
            window,
            mutex,
            backing,
            state: UnsafeCell::new(state),
        })
    }

    /// Mutable access to the per-process bookkeeping.
    ///
    /// # Safety
    ///
    /// Callers must be on the process's single allocator thread and must
    /// not hold another reference from a previous call. The write-fault
    /// handler qualifies: it interrupts that thread synchronously and the
    /// allocator never faults while holding such a reference.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn state_mut(&self) -> &mut HeapState {
        // SAFETY: caller contract.
        unsafe { &mut *self.state.get() }
    }

    /// Whether `extra` more mappings would put this process too close to
    /// the kernel's VMA ceiling.
    ///
    /// The margin keeps later `mmap` calls from unrelated libraries from
    /// failing: once the ceiling is hit, every mapping in the process
    /// fails, not just ours.
    pub(crate) fn close_to_map_limit(&self, extra: i64) -> bool {
        // SAFETY: single-threaded contract, read-only use.
        let state = unsafe { self.state_mut() };
        let margin = (state.map_ceiling / 16).max(1024);
        state.map_count + extra >= state.map_ceiling - margin
    }

    /// Collect one memory-usage sample from the shared counters.
    ///
    /// `alive_procs` is read without the mutex: it only changes at
    /// startup and teardown.
    pub(crate) fn sample_usage(&self) {
        // SAFETY: single-threaded contract.
        let state = unsafe { self.state_mut() };
        let counters = self.backing.counters();
        let page = self.window.page_size as u64;
        let alive = counters.alive_procs.load(Ordering::Relaxed).max(1) as u64;
        let footprint = state.block_alloc.footprint() as u64 * alive;
        let private = counters.private_pages.load(Ordering::Relaxed).max(0) as u64;
        let shared = counters.shared_pages.load(Ordering::Relaxed).max(0) as u64;
        let baseline = counters.baseline_pages.load(Ordering::Relaxed).max(0) as u64;

        state.stats.push(crate::stats::MemUsageSample {
            total_private: footprint + private * page,
            total_internal: footprint,
            total_zero: state.zero_pages.max(0) as u64 * page,
            total_shared: shared * page,
            total_unmerged: footprint + baseline * page,
            total_merged: footprint + (private + shared) * page,
        });
    }

    /// Tear down this process's view: flush output, leave the node,
    /// unlink shared resources if no sibling remains.
    pub(crate) fn teardown(&self) {
        // SAFETY: single-threaded contract.
        let state = unsafe { self.state_mut() };
        if state.finalized {
            return;
        }
        state.finalized = true;

        crate::fault::restore_default_handlers();

        state.stats.flush();
        if let Some(profiler) = state.profiler.as_mut() {
            let shared = self.backing.counters().shared_pages.load(Ordering::Relaxed);
            profiler.flush_epoch(shared);
        }
        state.similarity.report();
        if self.backing.rank() == 0 && state.baseline_peak > 0 {
            tracing::debug!(
                peak_bytes = state.baseline_peak * self.window.page_size as i64,
                "peak unmerged footprint"
            );
        }

        let remaining = {
            let _guard = self.mutex.lock();
            let counters = self.backing.counters();
            counters.alive_procs.fetch_sub(1, Ordering::AcqRel) - 1
        };

        // Live allocations die with the process; only the records go now.
        state.registry = AllocationRegistry::new();

        // No counter or sharing-map access follows in this process.
        self.backing.unmap_metadata();

        if remaining <= 0 {
            self.backing.shrink_and_unlink();
            self.mutex.close();
            self.mutex.unlink();
            tracing::debug!("last sibling out, backing unlinked");
        } else {
            self.mutex.close();
            tracing::debug!(remaining, "detached from backing");
        }
    }
}

/// Verify the kernel supports atomic remap-to-fixed-address.
///
/// Copy-on-write splitting moves a staged private page over the fault
/// address in one step; without `MREMAP_FIXED` there is a window where
/// the address is unmapped while siblings run. Refuse to start rather
/// than accept that window.
fn probe_atomic_remap(page_size: usize) -> Result<()> {
    // SAFETY: two fresh private pages, unmapped below.
    unsafe {
        let src = rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            page_size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE,
        )?;
        let dst = rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            page_size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE,
        )?;
        let moved = rustix::mm::mremap_fixed(src, page_size, page_size, MremapFlags::MAYMOVE, dst);
        match moved {
            Ok(ptr) if ptr == dst => {
                rustix::mm::munmap(dst, page_size)?;
                Ok(())
            }
            Ok(ptr) => {
                let _ = rustix::mm::munmap(ptr, page_size);
                Err(Error::AtomicRemapUnsupported)
            }
            Err(_) => {
                let _ = rustix::mm::munmap(src, page_size);
                let _ = rustix::mm::munmap(dst, page_size);
                Err(Error::AtomicRemapUnsupported)
            }
        }
    }
}

static HEAP: OnceLock<SharedHeap> = OnceLock::new();

/// The process heap, if init has completed.
pub(crate) fn heap() -> Option<&'static SharedHeap> {
    HEAP.get()
}

/// Initialize the allocator for this process.
///
/// Reads the environment, discovers the heap window, joins (or creates)
/// the node's shared backing, and installs the write-fault handlers.
/// Called from the launcher's init hook; standalone applications get it
/// lazily from the first allocation when `NOT_MPI_APP=1`.
///
/// # Errors
///
/// Fails on bad configuration, missing kernel support for atomic remap,
/// or any shm/semaphore/mmap error. The process is left unmodified on
/// failure.
pub fn init() -> Result<()> {
    if HEAP.get().is_some() {
        return Err(Error::Invariant("init called twice".into()));
    }
    let config = Config::from_env()?;
    let heap = SharedHeap::new(config)?;
    HEAP.set(heap)
        .map_err(|_| Error::Invariant("init raced itself".into()))?;

    crate::fault::install_handlers()?;

    // SAFETY: registering a no-argument extern "C" callback.
    unsafe { libc::atexit(finalize_at_exit) };
    Ok(())
}

/// Tear down the allocator: flush statistics, leave the node, and unlink
/// the shared backing and semaphore if this was the last sibling.
///
/// Idempotent; also runs from an `atexit` hook if never called.
pub fn finalize() {
    if let Some(heap) = HEAP.get() {
        heap.teardown();
    }
}

extern "C" fn finalize_at_exit() {
    finalize();
}
