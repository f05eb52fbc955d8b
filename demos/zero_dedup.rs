//! Minimal standalone walkthrough: allocate, touch, fold, split.
//!
//! Run several copies of this binary at once (same `SEM_KEY`) to watch
//! siblings share a backing; a single copy still exercises the zero-fold
//! and copy-on-write paths.
//!
//! ```sh
//! MERGE_METRIC=1 MALLOC_MERGE_FREQ=1 cargo run --example zero_dedup
//! ```

use std::ptr::{read_volatile, write_volatile};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    pagefold::init().expect("pagefold init");

    const MB: usize = 1 << 20;
    let buf = pagefold::malloc(4 * MB);
    assert!(!buf.is_null(), "allocation failed");
    println!("allocated 4 MiB at {buf:p} (usable {})", pagefold::usable_size(buf));

    // Touch every page with zeros: the next merge epoch folds all of
    // them onto the single zero-template page.
    unsafe {
        for off in (0..4 * MB).step_by(4096) {
            write_volatile(buf.add(off), 0);
        }
    }
    let driver = pagefold::malloc(4096);
    pagefold::free(driver);
    println!("touched 1024 pages, merge epoch driven");

    // Still readable through the template, and a write splits just the
    // one page back out.
    unsafe {
        assert_eq!(read_volatile(buf.add(2 * MB)), 0);
        write_volatile(buf.add(2 * MB), 42);
        assert_eq!(read_volatile(buf.add(2 * MB)), 42);
        assert_eq!(read_volatile(buf.add(2 * MB + 4096)), 0);
    }
    println!("split one page back out on write");

    pagefold::free(buf);
    pagefold::finalize();
    println!("done");
}
