//! Shared heap window layout and address translation.
//!
//! Every sibling process maps its deduplicated allocations inside one
//! 3 GiB virtual-address interval, the *shared heap window*, placed so that
//! the window occupies the same addresses in every sibling. The virtual
//! address `bottom + k * page_size` corresponds to file offset
//! `k * page_size` of the shared backing, which makes page-number math a
//! single subtract-and-shift.
//!
//! The window's position is discovered once at init by observing where the
//! OS places two fresh anonymous mappings and deciding whether the mmap
//! area grows up or down. Siblings launched from the same binary with the
//! same address-space layout land on the same window.

use crate::error::{Error, Result};
use rustix::mm::{MapFlags, ProtFlags};

/// Size of the shared heap window: 3 GiB.
///
/// Chosen to fit under OS mmap limits on x86-64 while covering the working
/// sets this allocator targets.
pub const WINDOW_BYTES: usize = 0xC000_0000;

/// Size of the sharing-bitmap region of the backing: 3 MiB.
pub const SHARING_REGION_BYTES: usize = 0x30_0000;

/// Fallback for `vm.max_map_count` when procfs is unavailable.
pub const DEFAULT_MAX_MAP_COUNT: i64 = 65_536;

/// The fixed virtual-address interval backed by the shared object.
#[derive(Debug, Clone, Copy)]
pub struct HeapWindow {
    /// Lowest address of the window (inclusive).
    pub bottom: usize,
    /// Highest address of the window (exclusive).
    pub top: usize,
    /// System page size.
    pub page_size: usize,
    /// `log2(page_size)`.
    pub page_shift: u32,
}

impl HeapWindow {
    /// Discover the window from the OS's current mmap placement.
    ///
    /// Maps two probe pages, compares their addresses to learn the grow
    /// direction, and anchors a 3 GiB interval at the first probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe mappings fail or the page size is not
    /// a power of two in `(0, 1 MiB]`.
    pub fn discover() -> Result<Self> {
        let page_size = rustix::param::page_size();
        if !page_size.is_power_of_two() || page_size > (1 << 20) {
            return Err(Error::Invariant(format!(
                "unusable page size {page_size}"
            )));
        }
        let page_shift = page_size.trailing_zeros();

        // SAFETY: fresh anonymous mappings at a kernel-chosen address.
        let probe1 = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                page_size,
                ProtFlags::READ,
                MapFlags::PRIVATE,
            )?
        };
        // SAFETY: as above.
        let probe2 = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                page_size,
                ProtFlags::READ,
                MapFlags::PRIVATE,
            )?
        };

        let addr1 = probe1 as usize;
        let addr2 = probe2 as usize;
        let (bottom, top) = if addr1 > addr2 {
            // The mmap area grows downward: the window hangs below probe1.
            let top = addr1 + page_size;
            (top - WINDOW_BYTES, top)
        } else {
            (addr1, addr1 + WINDOW_BYTES)
        };

        // SAFETY: unmapping the probes we just created.
        unsafe {
            rustix::mm::munmap(probe1, page_size)?;
            rustix::mm::munmap(probe2, page_size)?;
        }

        Ok(Self {
            bottom,
            top,
            page_size,
            page_shift,
        })
    }

    /// Construct a window at an explicit position (tests).
    #[cfg(test)]
    pub fn at(bottom: usize, page_size: usize) -> Self {
        Self {
            bottom,
            top: bottom + WINDOW_BYTES,
            page_size,
            page_shift: page_size.trailing_zeros(),
        }
    }

    /// Whether `addr` lies inside the window.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom && addr < self.top
    }

    /// Whether the whole region `[addr, addr + len)` lies inside the window.
    #[inline]
    pub fn contains_region(&self, addr: usize, len: usize) -> bool {
        self.contains(addr) && len <= self.top - addr
    }

    /// Translate a window address to its backing-file offset.
    ///
    /// Returns `None` for addresses outside the window.
    #[inline]
    pub fn offset_of(&self, addr: usize) -> Option<u64> {
        if self.contains(addr) {
            Some((addr - self.bottom) as u64)
        } else {
            None
        }
    }

    /// Translate a window address to its page number.
    ///
    /// Returns `None` for addresses outside the window.
    #[inline]
    pub fn page_index(&self, addr: usize) -> Option<usize> {
        self.offset_of(addr)
            .map(|off| (off >> self.page_shift) as usize)
    }

    /// Round an address down to its page boundary.
    #[inline]
    pub fn page_base(&self, addr: usize) -> usize {
        addr & !(self.page_size - 1)
    }

    /// Round a byte count up to whole pages; `None` on overflow.
    #[inline]
    pub fn round_up(&self, len: usize) -> Option<usize> {
        len.checked_next_multiple_of(self.page_size)
    }

    /// Number of pages the window spans.
    #[inline]
    pub fn page_count(&self) -> usize {
        WINDOW_BYTES >> self.page_shift
    }
}

/// Read the kernel's per-process mapping ceiling.
///
/// Falls back to [`DEFAULT_MAX_MAP_COUNT`] if procfs is unreadable, the
/// way a container without `/proc` mounted would behave.
pub fn read_max_map_count() -> i64 {
    match std::fs::read_to_string("/proc/sys/vm/max_map_count") {
        Ok(text) => text.trim().parse().unwrap_or(DEFAULT_MAX_MAP_COUNT),
        Err(_) => {
            tracing::warn!("could not read /proc/sys/vm/max_map_count, assuming 64K");
            DEFAULT_MAX_MAP_COUNT
        }
    }
}
