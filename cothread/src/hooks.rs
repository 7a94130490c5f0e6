//! Embedder hooks around switches.

use crate::runtime::{self, Cothread};

/// Callbacks invoked at the switch boundaries, for embedders that must
/// carry host state with each coroutine (an interpreter's top call frame,
/// recursion depth, pending-exception chain, ...).
///
/// The hooks run on the outgoing respectively incoming coroutine's stack
/// and must not themselves switch.
#[derive(Clone, Copy, Debug, Default)]
pub struct Hooks {
    /// Called on the outgoing coroutine just before the frame switch;
    /// snapshot host state into a coroutine-associated slot here.
    pub pre_switch: Option<fn(Cothread)>,
    /// Called on the incoming coroutine just after control returns to it;
    /// restore the snapshot here.
    pub post_switch: Option<fn(Cothread)>,
    /// Called instead of `post_switch` when a coroutine is entered for the
    /// first time, so host thread-local state starts out clean. Anything
    /// the reset owns must be released by the action before it returns.
    pub reset_state: Option<fn(Cothread)>,
}

/// Installs the hook set on the calling thread, replacing any previous
/// one. Initialises the thread's runtime if necessary.
pub fn set_hooks(hooks: Hooks) {
    let state = runtime::ensure_thread_state();
    // Safety: the state of the calling thread is live until
    // terminate_thread
    unsafe {
        (*state).hooks = hooks;
    }
}
