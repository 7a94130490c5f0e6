use cothread::{Cothread, Options};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::cell::Cell;

thread_local! {
    static PARENT: Cell<Option<Cothread>> = const { Cell::new(None) };
}

/// Bounces every argument straight back to the parent, forever.
fn echo(_: &mut [u8], mut arg: usize) -> usize {
    let parent = PARENT.get().unwrap();
    loop {
        arg = parent.switch(arg).unwrap();
    }
}

fn dedicated_switch(c: &mut Criterion) {
    let parent = cothread::current();
    PARENT.set(Some(parent));
    let co = Cothread::create(
        parent,
        echo,
        &[],
        &Options {
            guard_pages: 0,
            ..Options::default()
        },
    );

    c.bench_function("dedicated_switch", |b| {
        b.iter(|| co.switch(black_box(0)).unwrap())
    });
}

fn shared_switch(c: &mut Criterion) {
    let parent = cothread::current();
    PARENT.set(Some(parent));
    // Sharing the base stack makes every switch in the pair an
    // overlapping one, routed through the switcher frame with a full
    // save and restore.
    let co = Cothread::create(
        parent,
        echo,
        &[],
        &Options {
            share_with: Some(parent),
            ..Options::default()
        },
    );

    c.bench_function("shared_switch", |b| {
        b.iter(|| co.switch(black_box(0)).unwrap())
    });
}

fn create_and_exit(c: &mut Criterion) {
    let parent = cothread::current();
    let options = Options {
        stack_size: 1 << 16,
        guard_pages: 0,
        ..Options::default()
    };

    c.bench_function("create_and_exit", |b| {
        b.iter(|| {
            let co = Cothread::create(parent, |_, arg| arg, &[], &options);
            co.switch(black_box(0)).unwrap()
        })
    });
}

criterion_group!(benches, dedicated_switch, shared_switch, create_and_exit);
criterion_main!(benches);
