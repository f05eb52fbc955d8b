//! Threshold-policy behavior: the watermark fires during a burst of
//! first touches and the post-epoch usage log shows the fold.

use std::ptr::{read_volatile, write_volatile};

const PAGE: usize = 4096;

/// One `P: ...; L: ...; Z: ...; S: ...; U: ...; M: ...` line.
fn parse_usage_line(line: &str) -> Option<(u64, u64)> {
    let mut unmerged = None;
    let mut merged = None;
    for field in line.split(';') {
        let mut parts = field.trim().splitn(2, ':');
        let key = parts.next()?.trim();
        let value = parts.next()?.trim().parse::<u64>().ok()?;
        match key {
            "U" => unmerged = Some(value),
            "M" => merged = Some(value),
            _ => {}
        }
    }
    Some((unmerged?, merged?))
}

#[test]
fn threshold_epoch_fires_during_touches() {
    std::env::set_var("MERGE_METRIC", "2");
    std::env::set_var("MIN_MEM_TH", "10");
    std::env::set_var("SEM_KEY", format!("{}", 200_000 + std::process::id() % 100_000));

    pagefold::init().expect("init");

    // 15 MB of zero pages, touched one by one: the 10 MB watermark must
    // trip somewhere in the middle and fold the touched pages onto the
    // zero template.
    let size = 15 * 1000 * 1000;
    let buf = pagefold::malloc(size);
    assert!(!buf.is_null());
    let pages = pagefold::usable_size(buf) / PAGE;
    assert!(pages >= 3600);

    unsafe {
        for page in 0..pages {
            write_volatile(buf.add(page * PAGE), 0);
        }
        // Everything still reads zero afterwards, template-backed or not.
        for page in (0..pages).step_by(97) {
            assert_eq!(read_volatile(buf.add(page * PAGE)), 0);
            assert_eq!(read_volatile(buf.add(page * PAGE + PAGE / 2)), 0);
        }
        // Zero-backed pages still split on write.
        write_volatile(buf.add(PAGE), 9);
        assert_eq!(read_volatile(buf.add(PAGE)), 9);
        assert_eq!(read_volatile(buf.add(PAGE + 1)), 0);
    }

    assert!(pagefold::free(buf));
    pagefold::finalize();

    // Rank 0 wrote the node's usage log; the epoch left at least a
    // pre-merge and a post-merge sample, and after the fold the merged
    // footprint sits below the unmerged baseline.
    let host = rustix::system::uname().nodename().to_string_lossy().into_owned();
    let path = format!("memusage.{host}.0");
    let log = std::fs::read_to_string(&path).expect("usage log written");
    let samples: Vec<(u64, u64)> = log.lines().filter_map(parse_usage_line).collect();
    assert!(
        samples.len() >= 2,
        "expected a merge epoch during the touches, log:\n{log}"
    );
    let (unmerged, merged) = *samples.last().unwrap();
    assert!(
        merged < unmerged,
        "post-epoch sample should show a fold: merged={merged} unmerged={unmerged}"
    );

    let _ = std::fs::remove_file(&path);
}
