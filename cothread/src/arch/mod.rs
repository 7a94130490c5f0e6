// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Architecture-specific frame switching.
//!
//! Every backend exports the same four items:
//!
//! - `STACK_ALIGNMENT`: required alignment for stack bases and frame
//!   pointers.
//! - `switch_frame(old_frame, new_frame, arg)`: saves the full callee-saved
//!   register set on the current stack, publishes the resulting stack
//!   pointer through `old_frame`, adopts `new_frame` as the stack pointer
//!   and pops the mirror image. `arg` comes out of the `switch_frame` call
//!   that previously suspended the target frame.
//! - `create_frame(stack_base, entry, context)`: lays down a saved register
//!   image at `stack_base` such that the first switch into the returned
//!   frame calls `entry(arg, context)`. The image is position-independent
//!   until first activation and never exceeds
//!   [`INITIAL_FRAME_SIZE`](crate::INITIAL_FRAME_SIZE) bytes.
//! - `current_frame()`: the live stack pointer, usable only as a
//!   high-water mark.

use core::num::NonZeroUsize;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(target_arch = "riscv64")] {
        mod riscv64;
        pub use riscv64::*;
    } else {
        compile_error!("Unsupported target architecture");
    }
}

/// A saved machine context, identified by the stack address at which the
/// callee-saved registers and resume address have been pushed.
pub(crate) type FramePointer = NonZeroUsize;

/// Entry routine of a freshly created frame. Receives the argument of the
/// activating `switch_frame` and the context pointer given to
/// `create_frame`. Must never return.
pub(crate) type EntryFn<T> = unsafe extern "C" fn(arg: usize, context: *mut T) -> !;
