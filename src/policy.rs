//! Merge controller: decides when the merge engine runs.
//!
//! Three shipping policies plus an experimental one, selected once per
//! process lifetime by `MERGE_METRIC`:
//!
//! - **Disabled**: never merge.
//! - **Allocation-frequency**: one epoch every K allocations.
//! - **Threshold**: one epoch from the fault path when the node's
//!   private+shared page count passes a rising watermark, amortized by a
//!   per-fault countdown.
//! - **Buffered**: dirty pages collect in a fixed ring; a full ring
//!   merges them one page at a time.

use crate::config::{Config, MergePolicy, DIRTY_RING_CAPACITY};
use crate::layout::HeapWindow;
use crate::runtime::SharedHeap;
use std::sync::atomic::Ordering;

/// Faults between threshold checks.
const THRESHOLD_COUNTDOWN: u32 = 100;

/// Trigger state for the active merge policy.
pub(crate) struct MergeController {
    policy: MergePolicy,
    /// Allocation-frequency: allocations since the last epoch.
    alloc_counter: u64,
    alloc_frequency: u64,
    /// Threshold: rising watermark in pages.
    watermark: i64,
    /// Threshold: faults left before the next watermark check.
    countdown: u32,
    /// Buffered: dirty page addresses awaiting a merge pass.
    dirty_ring: Vec<usize>,
}

impl MergeController {
    pub(crate) fn new(config: &Config, window: &HeapWindow) -> Self {
        let dirty_ring = if config.merge_policy == MergePolicy::Buffered {
            Vec::with_capacity(DIRTY_RING_CAPACITY)
        } else {
            Vec::new()
        };
        Self {
            policy: config.merge_policy,
            alloc_counter: 0,
            alloc_frequency: config.merge_frequency,
            watermark: config.threshold_pages(window.page_size),
            countdown: THRESHOLD_COUNTDOWN,
            dirty_ring,
        }
    }

    pub(crate) fn policy(&self) -> MergePolicy {
        self.policy
    }
}

impl SharedHeap {
    /// Allocation-path trigger: every K-th allocation runs an epoch.
    pub(crate) fn merge_on_alloc(&self) {
        // SAFETY: single-threaded contract.
        let state = unsafe { self.state_mut() };
        if state.controller.policy != MergePolicy::AllocFrequency {
            return;
        }
        state.controller.alloc_counter += 1;
        if state.controller.alloc_counter % state.controller.alloc_frequency != 0 {
            return;
        }
        state.controller.alloc_counter = 0;

        self.sample_usage();
        self.merge_epoch();
        self.sample_usage();
    }

    /// Fault-path trigger for the threshold policy.
    ///
    /// The countdown keeps the fault handler on the trigger path without
    /// running the watermark check on every split; when the watermark
    /// fires it ratchets up to the current usage so the next epoch waits
    /// for real growth.
    pub(crate) fn merge_on_fault(&self) {
        // SAFETY: single-threaded contract.
        let state = unsafe { self.state_mut() };
        if state.controller.policy != MergePolicy::Threshold {
            return;
        }
        state.controller.countdown -= 1;
        if state.controller.countdown != 0 {
            return;
        }
        state.controller.countdown = THRESHOLD_COUNTDOWN;

        let counters = self.backing.counters();
        let in_use = counters.private_pages.load(Ordering::Relaxed)
            + counters.shared_pages.load(Ordering::Relaxed);
        if in_use < state.controller.watermark {
            return;
        }
        state.controller.watermark = in_use;

        self.sample_usage();
        self.merge_epoch();
        self.sample_usage();
    }

    /// Buffered-policy fault hook: remember the dirty page, merging the
    /// whole ring first if it is full.
    pub(crate) fn buffer_dirty_page(&self, page_addr: usize) {
        // SAFETY: single-threaded contract.
        let full = {
            let state = unsafe { self.state_mut() };
            state.controller.dirty_ring.len() == DIRTY_RING_CAPACITY
        };
        if full {
            self.merge_ring();
        }
        // SAFETY: single-threaded contract.
        let state = unsafe { self.state_mut() };
        state.controller.dirty_ring.push(page_addr);
    }

    /// Merge every page in the dirty ring, then empty it.
    fn merge_ring(&self) {
        // SAFETY: single-threaded contract. The ring is moved out so the
        // state borrow does not span the merges.
        let mut ring = {
            let state = unsafe { self.state_mut() };
            std::mem::take(&mut state.controller.dirty_ring)
        };
        for &addr in &ring {
            if self.close_to_map_limit(0) {
                tracing::warn!("close to mmap limit, abandoning buffered merge");
                break;
            }
            // The page may have been freed since it was recorded.
            // SAFETY: single-threaded contract.
            let touched = {
                let state = unsafe { self.state_mut() };
                self.window
                    .page_index(addr)
                    .is_some_and(|p| state.touched.get(p))
            };
            if touched {
                self.merge_single_page(addr);
            }
        }
        self.sample_usage();
        ring.clear();
        // SAFETY: single-threaded contract.
        let state = unsafe { self.state_mut() };
        state.controller.dirty_ring = ring;
    }
}
