//! Signal-driven copy-on-write: the SIGSEGV write-fault handler.
//!
//! Allocations start read-only, so the first write to any page traps
//! here and the handler decides how to materialize physical backing:
//!
//! - first touch: flip the page to read-write in place;
//! - zero-backed: replace the template mapping with a fresh anonymous
//!   page;
//! - shared: stage a private copy elsewhere and atomically remap it over
//!   the fault address (`MREMAP_FIXED`), so siblings never observe an
//!   unmapped window.
//!
//! Everything on this path keeps to the operations the design accepts as
//! practically signal-safe: `mmap`, `mprotect`, `mremap`, `memcpy`,
//! `memset`, and the named semaphore. `errno` is saved on entry and
//! restored on exit. Anything that is not a write fault on a window page
//! is a genuine crash and aborts.

use crate::config::MergePolicy;
use crate::error::Result;

/// `SEGV_ACCERR` from Linux's `asm-generic/siginfo.h`; not exposed by the
/// `libc` crate on glibc/musl targets.
const SEGV_ACCERR: libc::c_int = 2;
use crate::runtime::SharedHeap;
use crate::sem::ErrnoGuard;
use crate::stats::PageEvent;
use rustix::mm::{MapFlags, MprotectFlags, MremapFlags, ProtFlags};
use std::sync::atomic::Ordering;

/// Pages of baseline growth between rank-0 peak-footprint ratchets.
const PEAK_RATCHET_PAGES: i64 = 1000;

type SigactionHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Write a fixed message to stderr and abort.
///
/// The only failure reporting available inside the handler: no
/// formatting, no allocation, no locks.
pub(crate) fn raw_fatal(msg: &[u8]) -> ! {
    // SAFETY: writing a byte buffer to fd 2.
    unsafe {
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::abort()
    }
}

fn install(signal: libc::c_int, flags: libc::c_int) -> Result<()> {
    // SAFETY: zeroed sigaction is a valid starting point; the handler is
    // an extern "C" fn of the SA_SIGINFO shape.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = on_fault as SigactionHandler as usize;
        libc::sigemptyset(&mut act.sa_mask);
        act.sa_flags = libc::SA_SIGINFO | flags;
        if libc::sigaction(signal, &act, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Install the SIGSEGV and SIGBUS handlers.
pub(crate) fn install_handlers() -> Result<()> {
    install(libc::SIGSEGV, libc::SA_RESTART)?;
    install(libc::SIGBUS, 0)?;
    Ok(())
}

/// Put SIGSEGV and SIGBUS back to their default dispositions at teardown.
pub(crate) fn restore_default_handlers() {
    // SAFETY: resetting dispositions to SIG_DFL.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut act.sa_mask);
        libc::sigaction(libc::SIGSEGV, &act, std::ptr::null_mut());
        libc::sigaction(libc::SIGBUS, &act, std::ptr::null_mut());
    }
}

extern "C" fn on_fault(signal: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let _errno = ErrnoGuard::save();

    if signal == libc::SIGBUS {
        raw_fatal(b"pagefold: SIGBUS on shared backing, aborting\n");
    }

    // SAFETY: the kernel hands a populated siginfo_t to SA_SIGINFO
    // handlers.
    let (addr, code) = unsafe { ((*info).si_addr() as usize, (*info).si_code) };

    let Some(heap) = crate::runtime::heap() else {
        raw_fatal(b"pagefold: fault before init, aborting\n");
    };
    // A read fault, or any fault outside the heap window, is a real bug
    // in the application.
    if code & SEGV_ACCERR == 0 {
        raw_fatal(b"pagefold: segmentation fault (not a write to a protected page)\n");
    }
    if !heap.window.contains(addr) {
        raw_fatal(b"pagefold: write fault outside the shared heap window\n");
    }

    heap.handle_write_fault(addr);
}

impl SharedHeap {
    /// Split or upgrade the faulted page. Runs inside the SIGSEGV
    /// handler, on the process's only thread.
    pub(crate) fn handle_write_fault(&self, fault_addr: usize) {
        let page_size = self.window.page_size;
        let addr = self.window.page_base(fault_addr);
        let Some(page) = self.window.page_index(addr) else {
            raw_fatal(b"pagefold: fault page outside window\n");
        };

        // SAFETY: single-threaded contract; the handler interrupted the
        // allocator's thread at a point where no state borrow is live.
        let policy = unsafe { self.state_mut() }.controller.policy();
        match policy {
            MergePolicy::Disabled => {}
            MergePolicy::Buffered => self.buffer_dirty_page(addr),
            _ => {
                // SAFETY: as above.
                let state = unsafe { self.state_mut() };
                if let Some((_, region)) = state.registry.find_containing(addr) {
                    region.dirty.set(true);
                }
            }
        }

        // SAFETY: as above.
        let first_touch = !unsafe { self.state_mut() }.touched.set_and_return(page);
        if first_touch {
            self.account_first_touch(page_size);
            // SAFETY: upgrading the freshly touched page in place.
            if unsafe {
                rustix::mm::mprotect(
                    addr as *mut _,
                    page_size,
                    MprotectFlags::READ | MprotectFlags::WRITE,
                )
            }
            .is_err()
            {
                raw_fatal(b"pagefold: mprotect failed in fault handler\n");
            }
        } else {
            self.split_page(addr, page);
        }

        self.merge_on_fault();
    }

    /// First write to a page this process has never touched: count it and
    /// upgrade in place.
    fn account_first_touch(&self, page_size: usize) {
        let counters = self.backing.counters();
        let _guard = self.mutex.lock();
        counters.private_pages.fetch_add(1, Ordering::Relaxed);
        let baseline = counters.baseline_pages.fetch_add(1, Ordering::Relaxed) + 1;

        // SAFETY: single-threaded contract.
        let state = unsafe { self.state_mut() };
        if self.backing.rank() == 0 && baseline - state.baseline_peak > PEAK_RATCHET_PAGES {
            let alive = counters.alive_procs.load(Ordering::Relaxed).max(1);
            state.baseline_peak =
                baseline + state.block_alloc.footprint() as i64 * alive / page_size as i64;
        }
    }

    /// A previously merged page is being written: break it back out to a
    /// private writable copy.
    fn split_page(&self, addr: usize, page: usize) {
        let page_size = self.window.page_size;
        // SAFETY: single-threaded contract.
        let was_zero = unsafe { self.state_mut() }.zeroed.clear_and_return(page);
        let sharing = self.backing.sharing();
        let mask = self.backing.mask();
        let was_shared = sharing.test(page, mask);
        let counters = self.backing.counters();

        let _guard = self.mutex.lock();
        if was_zero {
            counters.private_pages.fetch_add(1, Ordering::Relaxed);
            // SAFETY: single-threaded contract.
            unsafe { self.state_mut() }.zero_pages -= 1;

            // MAP_FIXED swaps the template mapping for a fresh zero-filled
            // private page in one step.
            // SAFETY: addr is this process's page; no reference to its
            // contents is live across the fault.
            if unsafe {
                rustix::mm::mmap_anonymous(
                    addr as *mut _,
                    page_size,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::PRIVATE | MapFlags::FIXED,
                )
            }
            .is_err()
            {
                raw_fatal(b"pagefold: zero split failed\n");
            }
            self.note_maps(1);
        } else if was_shared {
            sharing.clear(page, mask);
            match sharing.count_sharers(page) {
                1 => {
                    // The last pair is gone: the survivor's page is
                    // nominally private again.
                    counters.shared_pages.fetch_sub(1, Ordering::Relaxed);
                    counters.private_pages.fetch_add(2, Ordering::Relaxed);
                }
                0 => {}
                _ => {
                    counters.private_pages.fetch_add(1, Ordering::Relaxed);
                }
            }
            {
                // SAFETY: single-threaded contract.
                let state = unsafe { self.state_mut() };
                if let Some(profiler) = state.profiler.as_mut() {
                    profiler.record(addr, PageEvent::SplitOut, 0);
                }
            }

            // Stage a private copy elsewhere, then atomically move it over
            // the fault address.
            // SAFETY: staging is fresh; addr stays mapped (read-only)
            // until the remap replaces it in one step.
            unsafe {
                let Ok(staging) = rustix::mm::mmap_anonymous(
                    std::ptr::null_mut(),
                    page_size,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::PRIVATE,
                ) else {
                    raw_fatal(b"pagefold: split staging mmap failed\n");
                };
                std::ptr::copy_nonoverlapping(addr as *const u8, staging.cast::<u8>(), page_size);
                if rustix::mm::mremap_fixed(
                    staging,
                    page_size,
                    page_size,
                    MremapFlags::MAYMOVE,
                    addr as *mut _,
                )
                .is_err()
                {
                    raw_fatal(b"pagefold: split remap failed\n");
                }
            }
            self.note_maps(1);
        } else {
            // Read-only but neither zero-backed nor shared: restore write
            // permission.
            // SAFETY: upgrading this process's page in place.
            if unsafe {
                rustix::mm::mprotect(
                    addr as *mut _,
                    page_size,
                    MprotectFlags::READ | MprotectFlags::WRITE,
                )
            }
            .is_err()
            {
                raw_fatal(b"pagefold: mprotect failed in fault handler\n");
            }
        }
    }
}
