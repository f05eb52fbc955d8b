//! With merging disabled the allocator is a page-aligned anonymous
//! allocator with bookkeeping: copy-on-write upgrades still happen, but
//! no page ever changes backing.

use std::ptr::{read_volatile, write_volatile};

const PAGE: usize = 4096;

#[test]
fn disabled_policy_is_plain_paged_allocator() {
    std::env::set_var("MERGE_METRIC", "0");
    std::env::set_var("SEM_KEY", format!("{}", 500_000 + std::process::id() % 100_000));

    pagefold::init().expect("init");

    let buf = pagefold::malloc(8 * PAGE);
    assert!(!buf.is_null());
    assert_eq!(pagefold::usable_size(buf), 8 * PAGE);

    unsafe {
        // Fresh pages read zero, accept writes, and keep them.
        assert_eq!(read_volatile(buf), 0);
        for page in 0..8 {
            write_volatile(buf.add(page * PAGE), page as u8 + 1);
        }
        for page in 0..8 {
            assert_eq!(read_volatile(buf.add(page * PAGE)), page as u8 + 1);
        }

        // Pages stay writable: a second write must not fault back into
        // a merge path (there is none to take).
        write_volatile(buf.add(3 * PAGE), 0xFF);
        assert_eq!(read_volatile(buf.add(3 * PAGE)), 0xFF);
    }

    // Zero-filled pages are left alone too; contents survive as long as
    // the allocation lives.
    let zeros = pagefold::malloc(4 * PAGE);
    assert!(!zeros.is_null());
    unsafe {
        for page in 0..4 {
            write_volatile(zeros.add(page * PAGE), 0);
        }
        for page in 0..4 {
            assert_eq!(read_volatile(zeros.add(page * PAGE)), 0);
        }
    }

    assert!(pagefold::free(zeros));
    assert!(pagefold::free(buf));

    // Foreign pointers behave the same regardless of policy.
    let mut local = 0u8;
    assert!(!pagefold::free(&mut local as *mut u8));

    pagefold::finalize();
}
