//! The merge engine: fold identical pages into shared or zero backings.
//!
//! One *merge epoch* walks the dirty allocation records in address order
//! and classifies every page:
//!
//! - **skip**: never touched, already zero-backed, or already shared by
//!   this process;
//! - **zero**: bytes equal the zero template: remap to backing offset 0;
//! - **move**: no sibling shares the page: copy it into the backing at
//!   its natural offset, then atomically remap in place;
//! - **share**: a sibling already shares the offset and the bytes
//!   compare equal: replace the private mapping, no copy;
//! - **distinct**: a sibling shares the offset but bytes differ: leave
//!   private (and feed the sub-page similarity histogram).
//!
//! Per-page `mmap`/`mprotect` dominates cost at scale, so contiguous
//! pages with the same class coalesce into one bulk remap, and the
//! comparison counterpart comes from a rotating 4 MiB window over the
//! backing instead of a per-page map/unmap.
//!
//! The entire scan runs under the interprocess mutex; concurrent faults
//! in siblings take the same mutex, so a classification holds until the
//! scan releases it.

use crate::runtime::SharedHeap;
use crate::stats::PageEvent;
use rustix::mm::{MprotectFlags, MremapFlags};
use std::sync::atomic::Ordering;

/// Size of the rotating comparison window over the backing.
const COMPARE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Classification of a mergeable page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunClass {
    /// Remap to the zero template.
    Zero,
    /// Copy into the backing, then remap.
    Move,
    /// Remap onto an existing shared page.
    Share,
}

/// A maximal run of contiguous pages with one classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Run {
    pub start: usize,
    pub end: usize,
    pub class: RunClass,
}

impl Run {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Accumulates page classifications into bulk runs.
///
/// Pages arrive in ascending address order. A page whose class matches
/// the open run extends it; anything else closes the run and hands it
/// back for flushing.
#[derive(Default)]
pub(crate) struct RunCoalescer {
    current: Option<Run>,
}

impl RunCoalescer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed one page. Returns a completed run that must be flushed
    /// before the scan continues.
    pub(crate) fn observe(
        &mut self,
        addr: usize,
        page_size: usize,
        class: Option<RunClass>,
    ) -> Option<Run> {
        match (self.current, class) {
            (Some(run), Some(class)) if run.class == class && run.end == addr => {
                self.current = Some(Run {
                    end: addr + page_size,
                    ..run
                });
                None
            }
            (prev, Some(class)) => {
                self.current = Some(Run {
                    start: addr,
                    end: addr + page_size,
                    class,
                });
                prev
            }
            (prev, None) => {
                self.current = None;
                prev
            }
        }
    }

    /// Close and return the open run at end of scan.
    pub(crate) fn take(&mut self) -> Option<Run> {
        self.current.take()
    }
}

/// Rotating read-write window over the backing for byte comparison.
struct CompareBuffer {
    base: *mut u8,
    /// Byte offset within the region where the window begins.
    begin: usize,
}

impl CompareBuffer {
    fn new() -> Self {
        Self {
            base: std::ptr::null_mut(),
            begin: 0,
        }
    }

    /// The counterpart bytes for the page at region offset `rel`, mapping
    /// the next window of the backing when `rel` walks past this one.
    fn counterpart<'a>(
        &mut self,
        heap: &SharedHeap,
        region_offset: u64,
        rel: usize,
    ) -> crate::error::Result<&'a [u8]> {
        let page_size = heap.window.page_size;
        if self.base.is_null() || rel - self.begin >= COMPARE_BUFFER_BYTES {
            self.release(heap);
            self.base = heap
                .backing
                .map_store_anywhere(COMPARE_BUFFER_BYTES, region_offset + rel as u64)?;
            self.begin = rel;
            heap.note_maps(1);
        }
        // SAFETY: rel - begin < window length; the mapping lives until
        // release and the returned slice is only used within the scan.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(rel - self.begin), page_size) })
    }

    fn release(&mut self, heap: &SharedHeap) {
        if !self.base.is_null() {
            // SAFETY: unmapping the window this buffer mapped.
            unsafe {
                let _ = rustix::mm::munmap(self.base.cast(), COMPARE_BUFFER_BYTES);
            }
            heap.note_maps(-1);
            self.base = std::ptr::null_mut();
        }
    }
}

/// Why a region scan ended early.
enum ScanStop {
    Done,
    MapCeiling,
    RemapFailed,
}

impl SharedHeap {
    /// Adjust the process VMA estimate.
    pub(crate) fn note_maps(&self, delta: i64) {
        // SAFETY: single-threaded contract.
        let state = unsafe { self.state_mut() };
        state.map_count += delta;
    }

    /// Run one merge epoch over every dirty allocation record.
    ///
    /// Runs on the fault path under the threshold policy, so the walk
    /// allocates nothing: a cursor re-finds the next dirty record after
    /// each region instead of collecting them up front.
    pub(crate) fn merge_epoch(&self) {
        let mut merged_total = 0usize;
        let mut cursor = 0usize;
        loop {
            // SAFETY: single-threaded contract; the borrow ends with the
            // lookup so the region merge can re-borrow freely.
            let next = unsafe { self.state_mut() }.registry.next_dirty_at(cursor);
            let Some((base, size, creator)) = next else {
                break;
            };
            cursor = base + 1;
            if self.close_to_map_limit((size / self.window.page_size) as i64) {
                tracing::warn!("close to mmap limit, backing off merge epoch");
                break;
            }
            // SAFETY: as above.
            unsafe { self.state_mut() }.registry.clear_dirty(base);
            match self.merge_region(base, size, creator) {
                (merged, ScanStop::Done) => merged_total += merged,
                (merged, _) => {
                    merged_total += merged;
                    break;
                }
            }
        }

        if merged_total > 0 {
            // SAFETY: single-threaded contract.
            let state = unsafe { self.state_mut() };
            if let Some(profiler) = state.profiler.as_mut() {
                let shared = self.backing.counters().shared_pages.load(Ordering::Relaxed);
                profiler.flush_epoch(shared);
            }
        }
        tracing::debug!(merged_pages = merged_total, "merge epoch complete");
    }

    /// Scan one region, folding mergeable runs into the backing.
    ///
    /// Returns the number of pages that ended shared or zero-backed and
    /// why the scan stopped.
    fn merge_region(&self, base: usize, size: usize, creator: usize) -> (usize, ScanStop) {
        let page_size = self.window.page_size;
        let Some(region_offset) = self.window.offset_of(base) else {
            tracing::warn!(base = format_args!("{base:#x}"), "region outside heap window");
            return (0, ScanStop::Done);
        };

        let guard = self.mutex.lock();
        let mut compare = CompareBuffer::new();
        let mut coalescer = RunCoalescer::new();
        let mut merged = 0usize;
        let mut stop = ScanStop::Done;

        for rel in (0..size).step_by(page_size) {
            if self.close_to_map_limit(0) {
                tracing::warn!("close to mmap limit, aborting region scan");
                stop = ScanStop::MapCeiling;
                break;
            }
            let addr = base + rel;
            let page = match self.window.page_index(addr) {
                Some(p) => p,
                None => break,
            };

            let class = match self.classify(page, addr, region_offset, rel, &mut compare) {
                Ok(class) => class,
                Err(e) => {
                    tracing::warn!(error = %e, "compare window unavailable, aborting scan");
                    stop = ScanStop::RemapFailed;
                    break;
                }
            };

            if let Some(run) = coalescer.observe(addr, page_size, class) {
                match self.flush_run(run, region_offset + (run.start - base) as u64, creator) {
                    Ok(pages) => merged += pages,
                    Err(e) => {
                        tracing::warn!(error = %e, "bulk remap failed, aborting scan");
                        stop = ScanStop::RemapFailed;
                        break;
                    }
                }
            }
        }

        if let Some(run) = coalescer.take() {
            match self.flush_run(run, region_offset + (run.start - base) as u64, creator) {
                Ok(pages) => merged += pages,
                Err(e) => {
                    tracing::warn!(error = %e, "bulk remap failed at end of scan");
                    stop = ScanStop::RemapFailed;
                }
            }
        }

        compare.release(self);
        drop(guard);
        (merged, stop)
    }

    /// Classify one page of a region. `None` means leave it alone.
    fn classify(
        &self,
        page: usize,
        addr: usize,
        region_offset: u64,
        rel: usize,
        compare: &mut CompareBuffer,
    ) -> crate::error::Result<Option<RunClass>> {
        {
            // SAFETY: single-threaded contract; borrow ends with the block.
            let state = unsafe { self.state_mut() };
            if !state.touched.get(page) || state.zeroed.get(page) {
                return Ok(None);
            }
        }
        let sharing = self.backing.sharing();
        let mask = self.backing.mask();
        if sharing.test(page, mask) {
            return Ok(None);
        }

        // SAFETY: the page belongs to a live allocation of this process
        // and is mapped readable in every state the handler leaves it in.
        let bytes = unsafe {
            std::slice::from_raw_parts(addr as *const u8, self.window.page_size)
        };
        if bytes == self.backing.zero_template() {
            return Ok(Some(RunClass::Zero));
        }
        if !sharing.others(page, mask) {
            return Ok(Some(RunClass::Move));
        }
        let counterpart = compare.counterpart(self, region_offset, rel)?;
        if bytes == counterpart {
            Ok(Some(RunClass::Share))
        } else {
            // SAFETY: single-threaded contract.
            let state = unsafe { self.state_mut() };
            state.similarity.record(bytes, counterpart);
            Ok(None)
        }
    }

    /// Apply one coalesced run with a single bulk remap.
    ///
    /// Returns the pages that became shared or zero-backed (moved pages
    /// stay accounted private until a sibling joins them).
    fn flush_run(&self, run: Run, offset: u64, creator: usize) -> crate::error::Result<usize> {
        let pages = run.len() / self.window.page_size;
        match run.class {
            RunClass::Zero => {
                self.remap_zero_run(run, creator)?;
                Ok(pages)
            }
            RunClass::Move => {
                self.copy_and_remap_run(run, offset)?;
                Ok(0)
            }
            RunClass::Share => {
                self.remap_shared_run(run, offset, creator)?;
                Ok(pages)
            }
        }
    }

    /// Remap every page of the run to the zero template.
    ///
    /// All pages map file offset 0, so this is the one flush that stays
    /// per-page.
    fn remap_zero_run(&self, run: Run, creator: usize) -> crate::error::Result<()> {
        let page_size = self.window.page_size;
        let counters = self.backing.counters();
        for addr in (run.start..run.end).step_by(page_size) {
            if self.close_to_map_limit(1) {
                return Err(crate::error::Error::MapCeiling {
                    // SAFETY: single-threaded contract.
                    count: unsafe { self.state_mut() }.map_count,
                    ceiling: unsafe { self.state_mut() }.map_ceiling,
                });
            }
            // SAFETY: addr is a page this process owns; the replaced
            // private page has no live references during the scan.
            unsafe { self.backing.map_store_fixed(addr, page_size, 0, false)? };
            self.note_maps(1);

            // SAFETY: single-threaded contract.
            let state = unsafe { self.state_mut() };
            state.zero_pages += 1;
            counters.private_pages.fetch_sub(1, Ordering::Relaxed);
            let page = self.window.page_index(addr).unwrap_or(0);
            state.zeroed.set(page);
            if let Some(profiler) = state.profiler.as_mut() {
                profiler.record(addr, PageEvent::MergedIn, creator);
            }
        }
        Ok(())
    }

    /// Copy a run into the backing at its natural offset, then atomically
    /// remap the private pages onto the shared copy.
    ///
    /// No sibling shares these offsets yet, so the shared counters do not
    /// move; the pages stay "private" until a sibling's scan finds them.
    fn copy_and_remap_run(&self, run: Run, offset: u64) -> crate::error::Result<()> {
        let len = run.len();
        let staging = self.backing.map_store_anywhere(len, offset)?;
        self.note_maps(1);
        // SAFETY: staging is a fresh len-byte mapping; the source run is
        // readable private memory of this process.
        unsafe {
            std::ptr::copy_nonoverlapping(run.start as *const u8, staging, len);
            rustix::mm::mremap_fixed(
                staging.cast(),
                len,
                len,
                MremapFlags::MAYMOVE,
                run.start as *mut _,
            )?;
        }

        let sharing = self.backing.sharing();
        let mask = self.backing.mask();
        for addr in (run.start..run.end).step_by(self.window.page_size) {
            if let Some(page) = self.window.page_index(addr) {
                sharing.set(page, mask);
            }
        }
        // SAFETY: protecting the run we just remapped.
        unsafe {
            rustix::mm::mprotect(run.start as *mut _, len, MprotectFlags::READ)?;
        }
        Ok(())
    }

    /// Replace a run of private pages with the sibling-shared backing
    /// pages that already hold identical bytes.
    fn remap_shared_run(&self, run: Run, offset: u64, creator: usize) -> crate::error::Result<()> {
        let len = run.len();
        // SAFETY: replacing this process's private pages under the mutex.
        unsafe { self.backing.map_store_fixed(run.start, len, offset, true)? };
        self.note_maps(1);

        let sharing = self.backing.sharing();
        let mask = self.backing.mask();
        let counters = self.backing.counters();
        for addr in (run.start..run.end).step_by(self.window.page_size) {
            let Some(page) = self.window.page_index(addr) else {
                continue;
            };
            if sharing.count_sharers(page) == 1 {
                // One holder until now: the pair is what makes it shared.
                counters.shared_pages.fetch_add(1, Ordering::Relaxed);
                counters.private_pages.fetch_sub(1, Ordering::Relaxed);
            }
            counters.private_pages.fetch_sub(1, Ordering::Relaxed);
            sharing.set(page, mask);

            // SAFETY: single-threaded contract.
            let state = unsafe { self.state_mut() };
            if let Some(profiler) = state.profiler.as_mut() {
                profiler.record(addr, PageEvent::MergedIn, creator);
            }
        }
        // SAFETY: protecting the run we just mapped.
        unsafe {
            rustix::mm::mprotect(run.start as *mut _, len, MprotectFlags::READ)?;
        }
        Ok(())
    }

    /// Merge one page, used by the buffered policy's ring drain.
    ///
    /// Returns true if the page ended shared.
    pub(crate) fn merge_single_page(&self, addr: usize) -> bool {
        let page_size = self.window.page_size;
        let addr = self.window.page_base(addr);
        let Some(page) = self.window.page_index(addr) else {
            return false;
        };
        let Some(offset) = self.window.offset_of(addr) else {
            return false;
        };

        let _guard = self.mutex.lock();
        let sharing = self.backing.sharing();
        let mask = self.backing.mask();
        if sharing.test(page, mask) {
            return false;
        }

        let run = Run {
            start: addr,
            end: addr + page_size,
            class: RunClass::Move,
        };

        if !sharing.others(page, mask) {
            if let Err(e) = self.copy_and_remap_run(run, offset) {
                tracing::warn!(error = %e, "single-page move failed");
            }
            return false;
        }

        let counterpart = match self.backing.map_store_anywhere(page_size, offset) {
            Ok(ptr) => ptr,
            Err(e) => {
                tracing::warn!(error = %e, "single-page probe failed");
                return false;
            }
        };
        self.note_maps(1);
        // SAFETY: both pages are mapped readable for page_size bytes.
        let equal = unsafe {
            std::slice::from_raw_parts(addr as *const u8, page_size)
                == std::slice::from_raw_parts(counterpart as *const u8, page_size)
        };

        if equal {
            let counters = self.backing.counters();
            if sharing.count_sharers(page) == 1 {
                counters.shared_pages.fetch_add(1, Ordering::Relaxed);
                counters.private_pages.fetch_sub(1, Ordering::Relaxed);
            }
            counters.private_pages.fetch_sub(1, Ordering::Relaxed);

            // SAFETY: the probe maps the identical backing page; moving it
            // over addr replaces the private copy in one step.
            let remapped = unsafe {
                rustix::mm::mremap_fixed(
                    counterpart.cast(),
                    page_size,
                    page_size,
                    MremapFlags::MAYMOVE,
                    addr as *mut _,
                )
            };
            if remapped.is_err() {
                crate::fault::raw_fatal(b"pagefold: single-page remap failed\n");
            }
            sharing.set(page, mask);
            // SAFETY: protecting the page we just remapped.
            unsafe {
                let _ = rustix::mm::mprotect(addr as *mut _, page_size, MprotectFlags::READ);
            }
            // SAFETY: single-threaded contract.
            let state = unsafe { self.state_mut() };
            if let Some(profiler) = state.profiler.as_mut() {
                profiler.record(addr, PageEvent::MergedIn, 0);
            }
            true
        } else {
            // SAFETY: single-threaded contract.
            let state = unsafe { self.state_mut() };
            // SAFETY: both pages remain mapped readable here.
            unsafe {
                state.similarity.record(
                    std::slice::from_raw_parts(addr as *const u8, page_size),
                    std::slice::from_raw_parts(counterpart as *const u8, page_size),
                );
                let _ = rustix::mm::munmap(counterpart.cast(), page_size);
            }
            self.note_maps(-1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS: usize = 4096;

    fn observe_all(classes: &[Option<RunClass>]) -> Vec<Run> {
        let mut coalescer = RunCoalescer::new();
        let mut runs = Vec::new();
        for (i, &class) in classes.iter().enumerate() {
            if let Some(run) = coalescer.observe(0x10000 + i * PS, PS, class) {
                runs.push(run);
            }
        }
        runs.extend(coalescer.take());
        runs
    }

    #[test]
    fn test_coalescer_merges_equal_classes() {
        let runs = observe_all(&[
            Some(RunClass::Zero),
            Some(RunClass::Zero),
            Some(RunClass::Zero),
        ]);
        assert_eq!(
            runs,
            vec![Run {
                start: 0x10000,
                end: 0x10000 + 3 * PS,
                class: RunClass::Zero
            }]
        );
    }

    #[test]
    fn test_coalescer_splits_on_class_change() {
        let runs = observe_all(&[
            Some(RunClass::Zero),
            Some(RunClass::Move),
            Some(RunClass::Move),
            Some(RunClass::Share),
        ]);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].class, RunClass::Zero);
        assert_eq!(runs[0].len(), PS);
        assert_eq!(runs[1].class, RunClass::Move);
        assert_eq!(runs[1].len(), 2 * PS);
        assert_eq!(runs[2].class, RunClass::Share);
    }

    #[test]
    fn test_coalescer_flushes_on_skip() {
        let runs = observe_all(&[
            Some(RunClass::Share),
            None,
            Some(RunClass::Share),
            Some(RunClass::Share),
        ]);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len(), PS);
        assert_eq!(runs[1].len(), 2 * PS);
        assert_eq!(runs[1].start, 0x10000 + 2 * PS);
    }

    #[test]
    fn test_coalescer_all_skips() {
        assert!(observe_all(&[None, None, None]).is_empty());
    }

    #[test]
    fn test_coalescer_no_trailing_run_lost() {
        let runs = observe_all(&[None, Some(RunClass::Move)]);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start, 0x10000 + PS);
        assert_eq!(runs[0].class, RunClass::Move);
    }
}
