//! Shared-stack switching.
//!
//! Multiple coroutines may map to the same stack region, with their frames
//! overlapping. Switching between two of them means copying the suspended
//! target's image back over the live bytes, which would overwrite the
//! caller's own registers mid-copy if done in place. The escape hatch is a
//! dedicated switcher frame per thread, running on a private stack disjoint
//! from every client stack: the caller hands it an action record and
//! suspends; the switcher performs the save and restore and completes the
//! switch into the target.
//!
//! Saved images are verbatim byte copies. They may contain absolute
//! addresses into the frame itself, so an image is only valid when restored
//! to the exact address range it was saved from. Stacks are shared, never
//! relocated.

use crate::arch::{self, FramePointer};
use crate::runtime::{Coroutine, ThreadState, run_action};
use crate::stack::valgrind;
use crate::utils::round_up;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{Ordering, compiler_fence};

/// Growth granularity for saved-image buffers.
const IMAGE_GRANULARITY: usize = 4096;

/// Heap buffer holding the live bytes of a suspended shared-stack frame.
pub(crate) struct SavedImage {
    buf: Box<[u8]>,
    len: usize,
}

impl SavedImage {
    pub fn new() -> Self {
        Self {
            buf: Box::default(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    /// Stores `len` bytes from `src`, reallocating in
    /// [`IMAGE_GRANULARITY`] steps when the buffer is too small.
    unsafe fn store(&mut self, src: *const u8, len: usize) {
        if len > self.buf.len() {
            self.buf = vec![0; round_up(len, IMAGE_GRANULARITY)].into_boxed_slice();
        }
        // Safety: buf now holds at least len bytes; the caller vouches for
        // the source range
        unsafe {
            ptr::copy_nonoverlapping(src, self.buf.as_mut_ptr(), len);
        }
        self.len = len;
    }
}

/// Request handed to the switcher frame: resume `target` carrying `arg`.
struct FrameAction {
    arg: usize,
    target: *mut Coroutine,
}

/// Saves the live region of `target`'s stack into its image buffer,
/// growing the buffer if necessary.
pub(crate) unsafe fn save_frame(target: *mut Coroutine) {
    // Safety: the caller guarantees target's frame is live on its stack
    unsafe {
        let stack = (*target).stack;
        let frame_size = (*stack).frame_length((*target).frame.get());
        // A base-stack frame can sit above the detected base when the
        // thread ran shallower than at initialisation time; there is
        // nothing to save then.
        let len = usize::try_from(frame_size).unwrap_or(0);
        (*target).saved.store((*target).frame.get() as *const u8, len);
    }
}

/// Copies `target`'s saved image back onto its stack and marks it the
/// stack's occupant. The image lands at the identical address it was saved
/// from.
pub(crate) unsafe fn restore_frame(target: *mut Coroutine) {
    // Safety: the caller guarantees the stack's live frame has been saved
    // (or its owner is gone), so the region may be overwritten
    unsafe {
        let stack = (*target).stack;
        let frame_start = (*target).frame.get() as *mut u8;
        let len = (*target).saved.len();
        valgrind::make_mem_undefined(frame_start, len);
        ptr::copy_nonoverlapping((*target).saved.as_ptr(), frame_start, len);
        (*stack).current = target;
    }
}

/// Switches from `this` to a `target` whose frame is not live on its stack.
pub(crate) unsafe fn switch_shared_frame(
    this: *mut Coroutine,
    target: *mut Coroutine,
    arg: usize,
) -> usize {
    // Safety: both coroutines belong to the calling thread and `this` is
    // the running coroutine
    unsafe {
        if (*this).stack == (*target).stack {
            // The target's frame overlaps the one we are running on, so the
            // copying has to happen off-stack: hand the request to the
            // switcher frame.
            let mut action = FrameAction { arg, target };
            arch::switch_frame(
                &raw mut (*this).frame,
                (*(*this).state).switcher_frame,
                (&raw mut action) as usize,
            )
        } else {
            // The frames don't overlap, so the swap can happen right here.
            // The target's stack may already be vacant, in which case there
            // is nothing to save.
            let occupant = (*(*target).stack).current;
            if !occupant.is_null() {
                save_frame(occupant);
            }
            restore_frame(target);
            arch::switch_frame(&raw mut (*this).frame, (*target).frame, arg)
        }
    }
}

/// The switcher: a permanent coroutine per thread that performs the
/// save/restore for overlapping switches from its own stack, then completes
/// the switch and waits for the next request.
pub(crate) unsafe extern "C" fn frame_switcher(mut action: usize, state: *mut ThreadState) -> ! {
    // Safety: activated only through switch_shared_frame, which passes a
    // live FrameAction on the suspending coroutine's stack
    unsafe {
        loop {
            // Pull the request off the caller's stack frame before the
            // save below destroys it.
            let request = action as *const FrameAction;
            let arg = (*request).arg;
            let target = (*request).target;

            // The reads above must not be reordered past the copy that
            // overwrites the frame they live in.
            compiler_fence(Ordering::SeqCst);

            save_frame((*(*target).stack).current);
            restore_frame(target);

            // Complete the switch into the target, then park until the
            // next request.
            action = arch::switch_frame(&raw mut (*state).switcher_frame, (*target).frame, arg);
        }
    }
}

/// Builds the initial frame of a stack-sharing coroutine.
///
/// The frame is laid out in a scratch buffer on the current stack, captured
/// as the coroutine's first saved image, and retargeted to the address it
/// will occupy once restored onto the shared stack.
pub(crate) unsafe fn create_shared_frame(co: *mut Coroutine) {
    #[repr(align(16))]
    struct Scratch([MaybeUninit<u8>; crate::INITIAL_FRAME_SIZE]);

    let mut scratch = Scratch([MaybeUninit::uninit(); crate::INITIAL_FRAME_SIZE]);
    let scratch_base = scratch.0.as_mut_ptr() as usize + crate::INITIAL_FRAME_SIZE;

    // Safety: the scratch buffer is big enough by the INITIAL_FRAME_SIZE
    // contract, and the image contains no addresses into itself, so it may
    // be relocated byte-for-byte before first activation
    unsafe {
        let frame = arch::create_frame(scratch_base, run_action, co);
        let frame_len = scratch_base - frame.get();
        debug_assert!(frame_len <= crate::INITIAL_FRAME_SIZE);
        (*co).saved.store(frame.get() as *const u8, frame_len);

        let stack_base = (*(*co).stack).base;
        (*co).frame = FramePointer::new_unchecked(stack_base - frame_len);
    }
}
