//! Two coroutines handing a counter back and forth, with the runtime's
//! parent/defunct plumbing doing the final unwinding.

use cothread::{Cothread, Options};
use std::cell::Cell;

thread_local! {
    static A: Cell<Option<Cothread>> = const { Cell::new(None) };
    static B: Cell<Option<Cothread>> = const { Cell::new(None) };
}

fn a_action(_: &mut [u8], mut arg: usize) -> usize {
    let b = B.get().unwrap();
    for _ in 0..5 {
        arg = b.switch(arg + 1).unwrap();
    }
    arg
}

fn b_action(_: &mut [u8], mut arg: usize) -> usize {
    let a = A.get().unwrap();
    for _ in 0..4 {
        arg = a.switch(arg + 1).unwrap();
    }
    arg
}

#[test]
fn ping_pong() {
    let p = cothread::current();
    let opts = Options {
        stack_size: 1 << 16,
        ..Options::default()
    };
    let a = Cothread::create(p, a_action, &[], &opts);
    let b = Cothread::create(a, b_action, &[], &opts);
    A.set(Some(a));
    B.set(Some(b));

    // Every switch in either loop increments the value once: 1 on entry,
    // plus 5 increments from A's turns and 4 from B's. B's return hands
    // control to its parent A, whose own return hands the final value back
    // here.
    assert_eq!(a.switch(1).unwrap(), 10);
}
