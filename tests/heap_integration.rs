//! End-to-end allocator behavior in one process.
//!
//! The allocator is process-global (signal handler, shared backing,
//! environment), so everything runs as one sequential scenario. The
//! frequency policy is pinned to merge on every allocation, which lets
//! each step drive a merge epoch deterministically with a throwaway
//! allocation.

use std::ptr::{read_volatile, write_volatile};

const PAGE: usize = 4096;

/// Allocating anything runs a merge epoch first (MALLOC_MERGE_FREQ=1).
fn run_merge_epoch() {
    let p = pagefold::malloc(PAGE);
    assert!(!p.is_null(), "epoch-driver allocation failed");
    assert!(pagefold::free(p));
}

#[test]
fn heap_end_to_end() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    std::env::set_var("MERGE_METRIC", "1");
    std::env::set_var("MALLOC_MERGE_FREQ", "1");
    std::env::set_var("SEM_KEY", format!("{}", 100_000 + std::process::id() % 100_000));

    pagefold::init().expect("init");

    // ========================================================================
    // Surface basics
    // ========================================================================

    // Zero-byte requests get a usable page.
    let p0 = pagefold::malloc(0);
    assert!(!p0.is_null());
    assert_eq!(pagefold::usable_size(p0), PAGE);
    assert!(pagefold::free(p0));

    // Sub-page requests go to the (inert) small-block allocator.
    assert!(pagefold::malloc(100).is_null());

    // Sizes round up to whole pages.
    let p = pagefold::malloc(PAGE + 1);
    assert_eq!(pagefold::usable_size(p), 2 * PAGE);

    // Foreign pointers are recognized as such.
    let mut local = 0u8;
    assert!(!pagefold::free(&mut local as *mut u8));
    assert!(pagefold::realloc(&mut local as *mut u8, PAGE).is_null());
    assert_eq!(pagefold::usable_size(&mut local as *mut u8), 0);

    // Double free is foreign the second time.
    assert!(pagefold::free(p));
    assert!(!pagefold::free(p));

    // ========================================================================
    // Back-to-back allocations never overlap
    // ========================================================================

    let blocks: Vec<*mut u8> = (0..8).map(|_| pagefold::malloc(4 * PAGE)).collect();
    for (i, &a) in blocks.iter().enumerate() {
        assert!(!a.is_null());
        for &b in &blocks[i + 1..] {
            let (a, b) = (a as usize, b as usize);
            assert!(a + 4 * PAGE <= b || b + 4 * PAGE <= a, "allocations overlap");
        }
    }
    for &b in &blocks {
        assert!(pagefold::free(b));
    }

    // ========================================================================
    // Copy-on-write: first touch upgrades in place
    // ========================================================================

    let buf = pagefold::malloc(4 * PAGE);
    assert!(!buf.is_null());

    // Reads of untouched pages see zeros without faulting them writable.
    unsafe {
        assert_eq!(read_volatile(buf), 0);
        assert_eq!(read_volatile(buf.add(4 * PAGE - 1)), 0);
    }

    // Writes land and persist.
    unsafe {
        for page in 0..4 {
            write_volatile(buf.add(page * PAGE), 0xA0 + page as u8);
        }
        for page in 0..4 {
            assert_eq!(read_volatile(buf.add(page * PAGE)), 0xA0 + page as u8);
        }
    }

    // ========================================================================
    // Zero-merge: all-zero pages fold onto the zero template
    // ========================================================================

    unsafe {
        // Make every page zero again (they are dirty, private, writable).
        for page in 0..4 {
            write_volatile(buf.add(page * PAGE), 0);
        }
    }
    run_merge_epoch();

    // Contents still read as zero through the template mapping.
    unsafe {
        for page in 0..4 {
            assert_eq!(read_volatile(buf.add(page * PAGE)), 0);
            assert_eq!(read_volatile(buf.add(page * PAGE + 123)), 0);
        }
    }

    // Writing a zero-backed page splits it back to a private copy.
    unsafe {
        write_volatile(buf.add(PAGE), 7);
        assert_eq!(read_volatile(buf.add(PAGE)), 7);
        // The rest of the split page is still zero.
        assert_eq!(read_volatile(buf.add(PAGE + 1)), 0);
        // Neighboring pages were not disturbed.
        assert_eq!(read_volatile(buf), 0);
        assert_eq!(read_volatile(buf.add(2 * PAGE)), 0);
    }

    // ========================================================================
    // Move-merge: distinct content moves into the shared backing
    // ========================================================================

    unsafe {
        for page in 0..4 {
            for off in (0..PAGE).step_by(512) {
                write_volatile(buf.add(page * PAGE + off), (0x10 + page) as u8);
            }
        }
    }
    run_merge_epoch();

    // Pages read back unchanged through the shared mapping.
    unsafe {
        for page in 0..4 {
            assert_eq!(read_volatile(buf.add(page * PAGE)), (0x10 + page) as u8);
            assert_eq!(read_volatile(buf.add(page * PAGE + 512)), (0x10 + page) as u8);
        }
    }

    // Write-after-merge splits: contents preserved, write visible.
    unsafe {
        write_volatile(buf.add(2 * PAGE + 100), 0xEE);
        assert_eq!(read_volatile(buf.add(2 * PAGE + 100)), 0xEE);
        assert_eq!(read_volatile(buf.add(2 * PAGE)), 0x12);
        assert_eq!(read_volatile(buf.add(2 * PAGE + 512)), 0x12);
        // Untouched sibling pages keep their merged contents.
        assert_eq!(read_volatile(buf.add(3 * PAGE)), 0x13);
    }

    // Idempotence: a second epoch with no intervening writes changes
    // nothing observable.
    run_merge_epoch();
    run_merge_epoch();
    unsafe {
        assert_eq!(read_volatile(buf), 0x10);
        assert_eq!(read_volatile(buf.add(2 * PAGE + 100)), 0xEE);
        assert_eq!(read_volatile(buf.add(3 * PAGE)), 0x13);
    }

    assert!(pagefold::free(buf));

    // ========================================================================
    // Realloc: grow across a merge, contents preserved byte-for-byte
    // ========================================================================

    let small = pagefold::malloc(2 * PAGE);
    assert!(!small.is_null());
    unsafe {
        for i in 0..2 * PAGE {
            write_volatile(small.add(i), (i % 251) as u8 | 1);
        }
    }
    run_merge_epoch();

    // Shrinking realloc returns the same pointer.
    assert_eq!(pagefold::realloc(small, PAGE), small);

    let grown = pagefold::realloc(small, 16 * PAGE);
    assert!(!grown.is_null());
    assert_ne!(grown, small);
    assert_eq!(pagefold::usable_size(grown), 16 * PAGE);
    unsafe {
        for i in 0..2 * PAGE {
            assert_eq!(read_volatile(grown.add(i)), (i % 251) as u8 | 1, "byte {i}");
        }
        // Fresh tail pages read zero and accept writes.
        assert_eq!(read_volatile(grown.add(10 * PAGE)), 0);
        write_volatile(grown.add(10 * PAGE), 42);
        assert_eq!(read_volatile(grown.add(10 * PAGE)), 42);
    }
    assert!(pagefold::free(grown));

    // ========================================================================
    // Teardown
    // ========================================================================

    pagefold::finalize();
    assert!(pagefold::malloc(PAGE).is_null());

    let host = rustix::system::uname().nodename().to_string_lossy().into_owned();
    let _ = std::fs::remove_file(format!("memusage.{host}.0"));
}
