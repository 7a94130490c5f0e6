//! Four coroutines sharing one stack, switching round-robin so that every
//! transfer between them runs through the overlapping-stack switcher.

use cothread::{Cothread, Options};
use std::cell::RefCell;

thread_local! {
    static RING: RefCell<Vec<Cothread>> = const { RefCell::new(Vec::new()) };
}

const ROUNDS: usize = 25;

fn worker(context: &mut [u8], mut arg: usize) -> usize {
    let index = usize::from(context[0]);
    let next = RING.with_borrow(|ring| ring[(index + 1) % ring.len()]);

    for _ in 0..ROUNDS {
        // context[1..] holds this worker's private counter.
        let count = usize::from_ne_bytes(context[1..].try_into().unwrap()) + 1;
        context[1..].copy_from_slice(&count.to_ne_bytes());
        arg = next.switch(arg + 1).unwrap();
    }
    usize::from_ne_bytes(context[1..].try_into().unwrap())
}

#[test]
fn shared_stack_fan_out() {
    let p = cothread::current();
    let owner = Cothread::create(
        p,
        |_, arg| arg,
        &[],
        &Options {
            stack_size: 65536,
            ..Options::default()
        },
    );
    let shared = Options {
        share_with: Some(owner),
        ..Options::default()
    };

    let workers: Vec<Cothread> = (0..4u8)
        .map(|index| {
            let mut context = [0u8; 1 + size_of::<usize>()];
            context[0] = index;
            Cothread::create(p, worker, &context, &shared)
        })
        .collect();
    RING.with_borrow_mut(|ring| ring.clone_from(&workers));

    // 100 switches round-robin through the ring; the first worker's loop
    // completes first and its exit returns here, then each remaining worker
    // is driven to completion. Every counter must have hit exactly ROUNDS.
    assert_eq!(workers[0].switch(0).unwrap(), ROUNDS);
    for worker in &workers[1..] {
        assert_eq!(worker.switch(0).unwrap(), ROUNDS);
    }

    // The stack's owner never ran; let it exit so the stack is reclaimed.
    assert_eq!(owner.switch(0).unwrap(), 0);
}
