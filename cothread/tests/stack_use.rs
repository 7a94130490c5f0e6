//! Stack accounting: live use from the frame position, high-water marks
//! from the check pattern.

use cothread::{Cothread, Options};
use std::cell::Cell;

thread_local! {
    static PARENT: Cell<Option<Cothread>> = const { Cell::new(None) };
}

#[inline(never)]
fn consume(depth: usize) {
    let mut buf = [0u8; 512];
    std::hint::black_box(&mut buf);
    if depth > 0 {
        consume(depth - 1);
    }
}

/// Dips `arg` levels deep, then reports back; exits when told 0.
fn burn(_: &mut [u8], mut arg: usize) -> usize {
    let parent = PARENT.get().unwrap();
    loop {
        if arg == 0 {
            return 0;
        }
        consume(arg);
        arg = parent.switch(arg).unwrap();
    }
}

#[test]
fn high_water_is_monotonic() {
    let p = cothread::current();
    PARENT.set(Some(p));
    let co = Cothread::create(
        p,
        burn,
        &[],
        &Options {
            stack_size: 1 << 16,
            check_pattern: true,
            guard_pages: 1,
            ..Options::default()
        },
    );

    let mut previous = 0;
    for depth in [1usize, 4, 8, 16, 24] {
        co.switch(depth).unwrap();
        let usage = co.stack_use();
        let max = usage.max_use.expect("check pattern was enabled");
        assert!(max >= previous, "high-water mark went backwards");
        assert!(usage.current_use > 0);
        assert_eq!(usage.stack_size, 1 << 16);
        previous = max;
    }
    assert!(previous >= 24 * 512, "deep excursions never registered");

    co.switch(0).unwrap();
}

#[test]
fn max_use_requires_check_pattern() {
    let p = cothread::current();
    let co = Cothread::create(
        p,
        |_, arg| arg,
        &[],
        &Options {
            stack_size: 1 << 16,
            ..Options::default()
        },
    );

    // Suspended and never entered: current use is exactly the initial
    // frame, and without the pattern there is no maximum to report.
    let usage = co.stack_use();
    assert!(usage.current_use > 0);
    assert!(usage.max_use.is_none());

    co.switch(0).unwrap();
}

#[test]
fn base_stack_reports_relative_use() {
    let base = cothread::current();
    let usage = base.stack_use();
    // The base stack owns no memory and its base drifts with the
    // initialisation point; only the size is pinned down.
    assert_eq!(usage.stack_size, 0);
    assert!(usage.max_use.is_none());
}
