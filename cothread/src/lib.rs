//! Symmetric stackful coroutines with shared-stack switching.
//!
//! This crate provides many lightweight coroutines on a single OS thread by
//! performing explicit, register-level stack switching. A [`Cothread`] is
//! an independently suspendable activity with its own callee-saved register
//! state and either a private stack or a stack shared copy-on-switch with
//! other coroutines. Switching is symmetric: any coroutine may transfer
//! control to any other of the same thread, carrying a value, and resumes
//! exactly where it last suspended.
//!
//! Coroutines are strictly cooperative and thread-affinitive: only
//! [`Cothread::switch`] suspends, there is no preemption, and a handle can
//! only be switched to from the thread that created it.
//!
//! ```
//! use cothread::{Cothread, Options};
//!
//! let base = cothread::current();
//! let co = Cothread::create(base, |_context, arg| arg + 1, &[], &Options::default());
//! assert_eq!(co.switch(41).unwrap(), 42);
//! ```
//!
//! ## Shared stacks
//!
//! Creating a coroutine with [`Options::share_with`] attaches it to an
//! existing coroutine's stack instead of allocating a fresh one. Sharers'
//! frames overlap, so each switch between them saves the live region into a
//! heap buffer and restores the target's image to the identical address,
//! routed through a small per-thread switcher frame whenever source and
//! destination overlap. This trades switch cost for memory: thousands of
//! mostly-idle coroutines can share one stack.
//!
//! ## Lifetime
//!
//! Every coroutine has a parent which receives control and the action's
//! result when the action returns. The exited coroutine's storage is
//! reclaimed by the next coroutine to receive control from it; its handles
//! dangle from then on. Lifetime is explicit: nothing is garbage collected,
//! and a live coroutine that is simply abandoned leaks its stack.

mod arch;
mod error;
mod hooks;
mod runtime;
mod shared;
mod stack;
mod utils;

pub use crate::arch::STACK_ALIGNMENT;
pub use crate::error::Error;
pub use crate::hooks::{Hooks, set_hooks};
pub use crate::runtime::{
    Action, Cothread, Options, StackUse, SwitchArg, current, init, init_thread, terminate_thread,
};
pub use crate::stack::MIN_STACK_SIZE;

/// Upper bound on the byte length of a freshly created frame.
///
/// Initial frames are laid out in a scratch buffer of this size and
/// relocated byte-for-byte onto their real stack.
pub const INITIAL_FRAME_SIZE: usize = 512;
