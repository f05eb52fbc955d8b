//! The allocator surface: page-level allocate, reallocate, free.
//!
//! Requests of a page or more are served from the shared heap window as
//! read-only anonymous mappings, so the first write to every page traps
//! into the fault handler and deduplication is the default state.
//! Sub-page requests delegate to the external small-block allocator
//! through [`BlockAllocator`].
//!
//! Foreign pointers (addresses this allocator never issued) are reported
//! back to the caller, never treated as errors: the embedding `malloc`
//! hook consults the small-block allocator for those.

use crate::registry::Region;
use crate::runtime::SharedHeap;
use crate::stats::PageEvent;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

/// Interface of the external small-block allocator.
///
/// The real implementation lives outside this crate, wired in by the
/// embedding runtime via [`set_block_allocator`]. Only three entry
/// points matter here: allocation and free for sub-page requests, and
/// the footprint that feeds the memory-usage log.
pub trait BlockAllocator {
    /// Allocate `size` bytes. Null on exhaustion.
    fn alloc(&self, size: usize) -> *mut u8;
    /// Free a pointer previously returned by `alloc`.
    fn free(&self, ptr: *mut u8);
    /// Bytes currently held by this allocator.
    fn footprint(&self) -> usize;
}

/// Default stand-in when no small-block allocator has been wired in:
/// refuses every request and reports an empty footprint.
pub struct NullBlockAllocator;

impl BlockAllocator for NullBlockAllocator {
    fn alloc(&self, _size: usize) -> *mut u8 {
        std::ptr::null_mut()
    }
    fn free(&self, _ptr: *mut u8) {}
    fn footprint(&self) -> usize {
        0
    }
}

impl SharedHeap {
    /// Allocate `size` bytes, rounded up to whole pages, as a read-only
    /// private mapping inside the heap window.
    ///
    /// Zero-byte requests are served one page. Returns `None` on OS
    /// refusal, a mapping that lands outside the window, or a VMA count
    /// near the ceiling.
    pub(crate) fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: single-threaded contract.
        if unsafe { self.state_mut() }.finalized {
            return None;
        }
        if self.close_to_map_limit(1) {
            tracing::warn!("close to mmap limit, refusing allocation");
            return None;
        }
        let rounded = self.window.round_up(size.max(1))?;

        self.merge_on_alloc();

        // SAFETY: fresh read-only anonymous mapping; first write faults
        // into the handler.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                rounded,
                ProtFlags::READ,
                MapFlags::PRIVATE,
            )
        }
        .ok()?;
        let base = ptr as usize;
        self.note_maps(1);

        if !self.window.contains_region(base, rounded) {
            // An allocation the window cannot address can never merge and
            // would poison the page index.
            // SAFETY: unmapping the region we just mapped.
            unsafe {
                let _ = rustix::mm::munmap(ptr, rounded);
            }
            self.note_maps(-1);
            tracing::warn!(
                base = format_args!("{base:#x}"),
                size = rounded,
                "mapping landed outside the heap window"
            );
            return None;
        }

        // SAFETY: single-threaded contract.
        let state = unsafe { self.state_mut() };
        state
            .registry
            .insert(base, Region::new(rounded, &self.config));

        NonNull::new(ptr.cast())
    }

    /// Size of the allocation at exactly `ptr`; 0 for foreign pointers.
    pub(crate) fn lookup_size(&self, ptr: usize) -> usize {
        // SAFETY: single-threaded contract.
        let state = unsafe { self.state_mut() };
        state.registry.find(ptr).unwrap_or(0)
    }

    /// Free the allocation at `ptr`. Returns false for foreign pointers.
    pub(crate) fn release(&self, ptr: usize) -> bool {
        // SAFETY: single-threaded contract.
        let region = match unsafe { self.state_mut() }.registry.remove(ptr) {
            Some(region) => region,
            None => return false,
        };

        // SAFETY: the region was a live allocation of exactly this size;
        // the caller promises no further access.
        unsafe {
            let _ = rustix::mm::munmap(ptr as *mut _, region.size);
        }
        self.note_maps(-1);

        let _guard = self.mutex.lock();
        if self.config.merge_policy == crate::config::MergePolicy::Disabled {
            self.release_bookkeeping_unmerged(ptr, region.size);
        } else {
            self.release_bookkeeping(ptr, region.size);
        }
        true
    }

    /// Per-page teardown of a freed region's metadata, merging enabled.
    ///
    /// A run of consecutive shared pages was one kernel VMA, so the map
    /// estimate drops once per run, mirroring the kernel's coalescing.
    fn release_bookkeeping(&self, base: usize, size: usize) {
        let page_size = self.window.page_size;
        let sharing = self.backing.sharing();
        let mask = self.backing.mask();
        let counters = self.backing.counters();
        let mut last_shared = false;

        for addr in (base..base + size).step_by(page_size) {
            let Some(page) = self.window.page_index(addr) else {
                continue;
            };
            // SAFETY: single-threaded contract.
            let state = unsafe { self.state_mut() };
            if !state.touched.clear_and_return(page) {
                // Never initialized; close out a preceding shared run.
                if last_shared {
                    state.map_count -= 1;
                    last_shared = false;
                }
                continue;
            }

            let was_zero = state.zeroed.clear_and_return(page);
            let was_shared = sharing.test(page, mask);
            counters.baseline_pages.fetch_sub(1, Ordering::Relaxed);

            if last_shared && !was_shared {
                state.map_count -= 1;
            }

            if was_zero {
                state.zero_pages -= 1;
                state.map_count -= 1;
                last_shared = false;
            } else if was_shared {
                match sharing.count_sharers(page) {
                    1 => {
                        counters.private_pages.fetch_sub(1, Ordering::Relaxed);
                    }
                    2 => {
                        // One sibling left behind: its copy turns private.
                        counters.shared_pages.fetch_sub(1, Ordering::Relaxed);
                        counters.private_pages.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                if let Some(profiler) = state.profiler.as_mut() {
                    profiler.record(addr, PageEvent::SplitOut, 0);
                }
                sharing.clear(page, mask);
                last_shared = true;
            } else {
                counters.private_pages.fetch_sub(1, Ordering::Relaxed);
                last_shared = false;
            }
        }
    }

    /// Freed-region metadata teardown when merging is disabled: only the
    /// touch bits and flat counters exist.
    fn release_bookkeeping_unmerged(&self, base: usize, size: usize) {
        let page_size = self.window.page_size;
        let counters = self.backing.counters();
        for addr in (base..base + size).step_by(page_size) {
            let Some(page) = self.window.page_index(addr) else {
                continue;
            };
            // SAFETY: single-threaded contract.
            let state = unsafe { self.state_mut() };
            if state.touched.clear_and_return(page) {
                counters.baseline_pages.fetch_sub(1, Ordering::Relaxed);
                counters.private_pages.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

fn set_errno(value: i32) {
    // SAFETY: writing the thread-local errno slot.
    unsafe { *libc::__errno_location() = value };
}

fn heap_or_lazy_init() -> Option<&'static SharedHeap> {
    if let Some(heap) = crate::runtime::heap() {
        return Some(heap);
    }
    // Standalone applications have no launcher hook to call init().
    let standalone = std::env::var("NOT_MPI_APP").is_ok_and(|v| v.trim() == "1");
    if standalone && crate::runtime::init().is_ok() {
        return crate::runtime::heap();
    }
    None
}

/// Allocate `size` bytes.
///
/// Requests under one page delegate to the small-block allocator;
/// zero-byte and page-or-larger requests come from the deduplicating
/// heap, rounded up to whole pages and mapped read-only so the first
/// write faults into the allocator.
///
/// Returns null with `errno = ENOMEM` on exhaustion, and null before
/// init has run (the embedding hook falls back to its own allocator).
pub fn malloc(size: usize) -> *mut u8 {
    set_errno(0);
    let Some(heap) = heap_or_lazy_init() else {
        return std::ptr::null_mut();
    };
    if size > 0 && size < heap.window.page_size {
        // SAFETY: single-threaded contract.
        let state = unsafe { heap.state_mut() };
        return state.block_alloc.alloc(size);
    }
    match heap.allocate(size) {
        Some(ptr) => ptr.as_ptr(),
        None => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

/// Resize the allocation at `ptr`.
///
/// Returns `ptr` unchanged when the existing pages already cover `size`;
/// otherwise allocates fresh pages, copies the smaller of the two sizes,
/// and frees the old region. Returns null for foreign pointers so the
/// embedding hook can consult the small-block allocator.
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    set_errno(0);
    if ptr.is_null() {
        return malloc(size);
    }
    let Some(heap) = heap_or_lazy_init() else {
        return std::ptr::null_mut();
    };

    let old_size = heap.lookup_size(ptr as usize);
    if old_size == 0 {
        // Not ours.
        return std::ptr::null_mut();
    }
    if old_size >= size {
        return ptr;
    }

    let new_ptr = match heap.allocate(size) {
        Some(p) => p.as_ptr(),
        None => {
            // SAFETY: single-threaded contract.
            let state = unsafe { heap.state_mut() };
            state.block_alloc.alloc(size)
        }
    };
    if new_ptr.is_null() {
        tracing::warn!(size, "realloc could not grow, returning old pointer");
        set_errno(libc::ENOMEM);
        return ptr;
    }

    // SAFETY: both regions are live and at least min(old, new) long; the
    // destination pages fault to writable as the copy walks them.
    unsafe {
        std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size));
    }
    heap.release(ptr as usize);
    new_ptr
}

/// Free the allocation at `ptr`.
///
/// Returns false for foreign pointers (the embedding hook forwards those
/// to the small-block allocator); null is a no-op returning true.
pub fn free(ptr: *mut u8) -> bool {
    if ptr.is_null() {
        return true;
    }
    let Some(heap) = crate::runtime::heap() else {
        return false;
    };
    heap.release(ptr as usize)
}

/// Size of the allocation at `ptr`, 0 for foreign pointers.
pub fn usable_size(ptr: *mut u8) -> usize {
    match crate::runtime::heap() {
        Some(heap) => heap.lookup_size(ptr as usize),
        None => 0,
    }
}

/// Wire in the external small-block allocator.
///
/// Replaces the inert default. Must run after [`crate::init`] and before
/// any sub-page allocation that should reach it.
pub fn set_block_allocator(alloc: Box<dyn BlockAllocator>) {
    if let Some(heap) = crate::runtime::heap() {
        // SAFETY: single-threaded contract.
        let state = unsafe { heap.state_mut() };
        state.block_alloc = alloc;
    }
}
