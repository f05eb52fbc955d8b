//! Buffered policy: dirty pages collect in the ring and merge one by one
//! when it fills.

use std::ptr::{read_volatile, write_volatile};

const PAGE: usize = 4096;

/// The ring holds this many addresses before a drain.
const RING: usize = 10_000;

#[test]
fn ring_drain_merges_single_pages() {
    std::env::set_var("MERGE_METRIC", "3");
    std::env::set_var("SEM_KEY", format!("{}", 400_000 + std::process::id() % 100_000));

    pagefold::init().expect("init");

    // Enough pages to fill the ring and force one drain.
    let pages = RING + 64;
    let buf = pagefold::malloc(pages * PAGE);
    assert!(!buf.is_null());

    unsafe {
        for page in 0..pages {
            write_volatile(buf.add(page * PAGE), 0);
        }

        // Drained pages moved into the backing; contents unchanged.
        for page in (0..pages).step_by(251) {
            assert_eq!(read_volatile(buf.add(page * PAGE)), 0);
        }

        // A merged page still splits out on write.
        write_volatile(buf.add(17 * PAGE), 0xCC);
        assert_eq!(read_volatile(buf.add(17 * PAGE)), 0xCC);
        assert_eq!(read_volatile(buf.add(17 * PAGE + 9)), 0);
        assert_eq!(read_volatile(buf.add(16 * PAGE)), 0);
    }

    assert!(pagefold::free(buf));
    pagefold::finalize();

    let host = rustix::system::uname().nodename().to_string_lossy().into_owned();
    let _ = std::fs::remove_file(format!("memusage.{host}.0"));
}
