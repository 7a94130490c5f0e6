//! Coroutines are thread-affinitive: handles may travel, switches may not.

use cothread::{Cothread, Error, Options};
use std::sync::mpsc;

#[test]
fn foreign_thread_switch_is_refused() {
    let (to_main, from_worker) = mpsc::channel();
    let (to_worker, from_main) = mpsc::channel();

    let worker = std::thread::spawn(move || {
        let base = cothread::init_thread();
        let x = Cothread::create(base, |_, arg| arg + 1, &[], &Options::default());
        assert!(x.check());
        to_main.send(x).unwrap();

        // Wait until the other thread has been refused, then confirm the
        // coroutine is untouched and still switchable at home.
        from_main.recv().unwrap();
        assert_eq!(x.switch(1).unwrap(), 2);
        cothread::terminate_thread();
    });

    let x = from_worker.recv().unwrap();

    // Refused before this thread has any runtime state at all...
    assert_eq!(x.switch(0), Err(Error::ForeignCothread));

    // ...and equally refused once it does.
    cothread::init_thread();
    assert!(!x.check());
    assert_eq!(x.switch(0), Err(Error::ForeignCothread));
    cothread::terminate_thread();

    to_worker.send(()).unwrap();
    worker.join().unwrap();
}
