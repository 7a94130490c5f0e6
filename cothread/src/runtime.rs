//! Coroutine objects and the per-thread runtime.
//!
//! Every OS thread owns an independent universe of coroutines: a base
//! coroutine wrapping the original thread stack, a current-coroutine
//! pointer and the switcher frame used for overlapping-stack switches. All
//! of it lives behind a thread-local and is only ever touched by the
//! running coroutine of that thread, so nothing here takes a lock.

use crate::arch::{self, FramePointer};
use crate::error::Error;
use crate::hooks::Hooks;
use crate::shared::{self, SavedImage};
use crate::stack::StackRegion;
use crate::stack::valgrind::ValgrindStackRegistration;
use core::cell::Cell;
use core::mem::ManuallyDrop;
use core::ptr::{self, NonNull};
use std::alloc::{self, Layout};
use std::panic::{self, AssertUnwindSafe};
use std::process;

/// Size of the private stack the switcher frame runs on. The switcher is a
/// single self-contained loop, so a tiny stack suffices.
const SWITCHER_STACK_SIZE: usize = 4096;

/// Value transferred across a switch.
pub type SwitchArg = usize;

/// Entry action of a coroutine.
///
/// Receives the context bytes copied at creation and the argument of the
/// switch that first activated it. The return value is handed to the
/// parent, after which the coroutine is defunct.
pub type Action = fn(context: &mut [u8], arg: SwitchArg) -> SwitchArg;

pub(crate) struct Coroutine {
    /// Saved frame; meaningful only while the coroutine is suspended.
    pub frame: FramePointer,
    pub stack: *mut StackRegion,
    action: Action,
    /// Receives control and the action's result when this coroutine exits.
    parent: *mut Coroutine,
    /// An exited peer whose storage this coroutine must reclaim on its next
    /// wake.
    defunct: *mut Coroutine,
    /// Identity of the owning thread's runtime state.
    pub state: *mut ThreadState,
    /// Set once the action has returned; reclamation is pending.
    dead: bool,
    /// Live-bytes image used while suspended on a shared stack.
    pub saved: SavedImage,
    /// User context copied at creation.
    context: Box<[u8]>,
}

pub(crate) struct ThreadState {
    /// Wrapper for the original thread stack.
    base: *mut Coroutine,
    pub current: *mut Coroutine,
    /// Frame of the shared-stack switcher (see [`crate::shared`]).
    pub switcher_frame: FramePointer,
    switcher_stack: *mut u8,
    switcher_valgrind: ManuallyDrop<ValgrindStackRegistration>,
    pub hooks: Hooks,
}

thread_local! {
    static STATE: Cell<*mut ThreadState> = const { Cell::new(ptr::null_mut()) };
}

fn switcher_stack_layout() -> Layout {
    Layout::from_size_align(SWITCHER_STACK_SIZE, crate::STACK_ALIGNMENT)
        .expect("invalid switcher stack layout")
}

/// One-time process initialisation. Idempotent, and optional: everything it
/// prepares is also set up lazily on first use.
pub fn init() {
    crate::stack::page_size();
}

/// Establishes the runtime on the calling thread and returns the base
/// coroutine wrapping the original thread stack.
///
/// # Panics
///
/// Panics if the thread was already initialised.
pub fn init_thread() -> Cothread {
    assert!(
        STATE.get().is_null(),
        "cothread runtime already initialised on this thread"
    );
    let state = init_thread_state();
    // Safety: a freshly initialised thread has a base coroutine
    Cothread {
        co: unsafe { NonNull::new_unchecked((*state).base) },
    }
}

/// Returns the coroutine currently running on the calling thread,
/// initialising the runtime on first use.
pub fn current() -> Cothread {
    // Safety: an initialised thread always has a current coroutine
    Cothread {
        co: unsafe { NonNull::new_unchecked((*ensure_thread_state()).current) },
    }
}

/// Tears down the calling thread's runtime.
///
/// Must be called from the base coroutine, with no coroutines still mapped
/// to the base stack. Coroutines on their own stacks that are simply
/// abandoned are leaked, exactly as if the thread had exited.
///
/// # Panics
///
/// Panics when called from a non-base coroutine, on an uninitialised
/// thread, or while base-stack sharers are still live.
pub fn terminate_thread() {
    let state = STATE.get();
    assert!(
        !state.is_null(),
        "cothread runtime not initialised on this thread"
    );
    // Safety: state stays live to the end of this function and is detached
    // from the thread-local before it is freed
    unsafe {
        assert!(
            (*state).current == (*state).base,
            "terminate_thread must be called from the base coroutine"
        );
        let base = (*state).base;
        let stack = (*base).stack;
        assert_eq!(
            (*stack).ref_count,
            1,
            "coroutines sharing the base stack are still live"
        );
        (*stack).ref_count = 0;
        drop(Box::from_raw(stack));
        drop(Box::from_raw(base));

        let mut state = Box::from_raw(state);
        ManuallyDrop::drop(&mut state.switcher_valgrind);
        alloc::dealloc(state.switcher_stack, switcher_stack_layout());
        drop(state);
    }
    STATE.set(ptr::null_mut());
    tracing::trace!("cothread runtime terminated on this thread");
}

pub(crate) fn ensure_thread_state() -> *mut ThreadState {
    let state = STATE.get();
    if state.is_null() { init_thread_state() } else { state }
}

#[cold]
fn init_thread_state() -> *mut ThreadState {
    // The switcher needs its stack in place before its frame can be built.
    // Safety: the layout has non-zero size
    let switcher_stack = unsafe { alloc::alloc(switcher_stack_layout()) };
    if switcher_stack.is_null() {
        tracing::error!("failed to allocate switcher stack; aborting");
        process::abort();
    }

    let state = Box::into_raw(Box::new(ThreadState {
        base: ptr::null_mut(),
        current: ptr::null_mut(),
        switcher_frame: arch::current_frame(), // placeholder, set below
        switcher_stack,
        switcher_valgrind: ManuallyDrop::new(ValgrindStackRegistration::new(
            switcher_stack,
            SWITCHER_STACK_SIZE,
        )),
        hooks: Hooks::default(),
    }));

    let base = Box::into_raw(Box::new(Coroutine {
        frame: arch::current_frame(), // placeholder until the first switch away
        stack: ptr::null_mut(),
        action: |_, arg| arg, // never invoked
        parent: ptr::null_mut(),
        defunct: ptr::null_mut(),
        state,
        dead: false,
        saved: SavedImage::new(),
        context: Box::default(),
    }));

    // Anywhere within the live frame works as the base stack's base, as
    // long as it is properly aligned: memory above it is shared and
    // managed, memory below it is exclusive to the base coroutine.
    let probe = (&raw const base) as usize;

    // Safety: state and base were just leaked and are fully owned here
    unsafe {
        (*state).switcher_frame = arch::create_frame(
            switcher_stack as usize + SWITCHER_STACK_SIZE,
            shared::frame_switcher,
            state,
        );
        (*base).stack = Box::into_raw(StackRegion::base_stack(base, probe));
        (*state).base = base;
        (*state).current = base;
    }

    STATE.set(state);
    tracing::trace!("cothread runtime initialised on this thread");
    state
}

/// Creation-time configuration for [`Cothread::create`].
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Usable stack size in bytes when a fresh stack is allocated. Rounded
    /// up to [`MIN_STACK_SIZE`](crate::MIN_STACK_SIZE) and the required
    /// alignment.
    pub stack_size: usize,
    /// Pre-fill the stack with a sentinel byte so
    /// [`Cothread::stack_use`] can report a high-water mark, and log the
    /// final usage when the stack is released.
    pub check_pattern: bool,
    /// Number of no-access pages placed past the overflow end, turning a
    /// stack overflow into a deterministic fault.
    pub guard_pages: usize,
    /// Share the stack of this coroutine instead of allocating one. All
    /// sharers' frames overlap; switching between them copies the live
    /// region in and out of heap buffers.
    pub share_with: Option<Cothread>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            stack_size: 1 << 20,
            check_pattern: false,
            guard_pages: 4,
            share_with: None,
        }
    }
}

/// Stack accounting returned by [`Cothread::stack_use`].
#[derive(Clone, Copy, Debug)]
pub struct StackUse {
    /// Bytes between the stack base and the coroutine's frame: the live
    /// stack pointer for the running coroutine, the saved frame otherwise.
    /// On the base coroutine this is relative to the base detected at
    /// initialisation and may be negative.
    pub current_use: isize,
    /// Deepest use ever observed. `None` unless the stack was created with
    /// [`Options::check_pattern`].
    pub max_use: Option<usize>,
    /// Usable stack size in bytes; 0 for the base stack.
    pub stack_size: usize,
}

/// Handle to a coroutine.
///
/// Handles are small, copyable and compare by identity. They may be moved
/// freely between threads, but a coroutine can only be switched to from the
/// thread it was created on; [`switch`](Cothread::switch) and
/// [`check`](Cothread::check) reject foreign handles. Once a coroutine has
/// exited and been reclaimed its handles dangle, and any further use of
/// them is undefined.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Cothread {
    pub(crate) co: NonNull<Coroutine>,
}

// Safety: all mutation happens on the owning thread; switch and check
// refuse handles that belong to another thread
unsafe impl Send for Cothread {}
// Safety: see above
unsafe impl Sync for Cothread {}

impl Cothread {
    /// Creates a new coroutine.
    ///
    /// `context` is copied into the coroutine and handed to `action`, along
    /// with the argument of the first switch into it, once the coroutine is
    /// first activated. When `action` returns, control and its result
    /// transfer to `parent` and the coroutine's storage is reclaimed; the
    /// handle must not be used past that point.
    ///
    /// Aborts the process if the stack cannot be allocated.
    ///
    /// # Panics
    ///
    /// Panics if `parent` (or `options.share_with`) does not belong to the
    /// calling thread.
    pub fn create(parent: Cothread, action: Action, context: &[u8], options: &Options) -> Cothread {
        assert!(parent.check(), "parent must belong to the calling thread");
        // Safety: checked above that parent is a coroutine of this thread
        let state = unsafe { (*parent.co.as_ptr()).state };

        let co = Box::into_raw(Box::new(Coroutine {
            frame: arch::current_frame(), // placeholder until the initial frame is built
            stack: ptr::null_mut(),
            action,
            parent: parent.co.as_ptr(),
            defunct: ptr::null_mut(),
            state,
            dead: false,
            saved: SavedImage::new(),
            context: context.into(),
        }));

        // Safety: co was just leaked and is fully owned until the handle is
        // returned
        unsafe {
            if let Some(share) = options.share_with {
                assert!(share.check(), "share_with must belong to the calling thread");
                let stack = (*share.co.as_ptr()).stack;
                (*stack).ref_count += 1;
                (*co).stack = stack;
                shared::create_shared_frame(co);
            } else {
                let stack = StackRegion::allocate(
                    co,
                    options.stack_size,
                    options.check_pattern,
                    options.guard_pages,
                )
                .unwrap_or_else(|err| {
                    tracing::error!(%err, "failed to allocate coroutine stack; aborting");
                    process::abort()
                });
                let stack = Box::into_raw(stack);
                (*co).stack = stack;
                (*co).frame = arch::create_frame((*stack).base, run_action, co);
            }
        }

        tracing::trace!(shared = options.share_with.is_some(), "created coroutine");
        // Safety: Box::into_raw never returns null
        Cothread {
            co: unsafe { NonNull::new_unchecked(co) },
        }
    }

    /// Transfers control to this coroutine, handing it `arg`.
    ///
    /// Returns the value carried by whichever switch later resumes the
    /// caller: the argument of an explicit switch back, or the action
    /// result of an exiting coroutine whose parent is the caller.
    ///
    /// Refuses, with no state change, to switch to a coroutine of another
    /// thread or to one whose action has already returned (the latter is
    /// detected on a best-effort basis; a reclaimed handle is dangling and
    /// its use is undefined). Switching to the running coroutine itself is
    /// likewise undefined.
    pub fn switch(self, arg: SwitchArg) -> Result<SwitchArg, Error> {
        let state = STATE.get();
        let target = self.co.as_ptr();
        // Safety: the handle contract guarantees the referent has not been
        // reclaimed; everything else is validated here
        unsafe {
            if state.is_null() || (*target).state != state {
                return Err(Error::ForeignCothread);
            }
            if (*target).dead {
                return Err(Error::Defunct);
            }

            let this = (*state).current;
            if let Some(pre) = (*state).hooks.pre_switch {
                pre(Cothread {
                    co: NonNull::new_unchecked(this),
                });
            }

            let result = if (*(*target).stack).current == target {
                // The target's frame is live on its stack; switch straight
                // in.
                arch::switch_frame(&raw mut (*this).frame, (*target).frame, arg)
            } else {
                shared::switch_shared_frame(this, target, arg)
            };

            // Back in `this`'s context. The peer that handed control back
            // may have exited, leaving itself in our defunct slot.
            (*state).current = this;
            if let Some(post) = (*state).hooks.post_switch {
                post(Cothread {
                    co: NonNull::new_unchecked(this),
                });
            }
            let defunct = (*this).defunct;
            if !defunct.is_null() {
                (*this).defunct = ptr::null_mut();
                delete_coroutine(defunct);
            }
            Ok(result)
        }
    }

    /// Whether this handle refers to a coroutine of the calling thread.
    pub fn check(self) -> bool {
        // A coroutine's state pointer is never null, so an uninitialised
        // thread (null TLS) can never match.
        // Safety: the handle contract guarantees the referent has not been
        // reclaimed
        unsafe { (*self.co.as_ptr()).state == STATE.get() }
    }

    /// Reports stack accounting for this coroutine.
    pub fn stack_use(self) -> StackUse {
        // Safety: the handle contract guarantees the referent has not been
        // reclaimed
        unsafe {
            let co = self.co.as_ptr();
            let stack = (*co).stack;
            let frame = if co == (*(*co).state).current {
                arch::current_frame()
            } else {
                (*co).frame
            };
            StackUse {
                current_use: (*stack).frame_length(frame.get()),
                max_use: (*stack).check_pattern.then(|| (*stack).high_water()),
                stack_size: (*stack).size,
            }
        }
    }
}

/// Body of every created coroutine: runs the action, then marks itself
/// defunct and hands the result to the parent. Control never returns here;
/// the receiver of the final switch reclaims the storage.
pub(crate) unsafe extern "C" fn run_action(arg: usize, co: *mut Coroutine) -> ! {
    // Safety: `co` is the coroutine this frame was created for, activated
    // on its owning thread
    unsafe {
        let state = (*co).state;
        (*state).current = co;
        if let Some(reset) = (*state).hooks.reset_state {
            reset(Cothread {
                co: NonNull::new_unchecked(co),
            });
        }

        let action = (*co).action;
        let context: &mut [u8] = &mut (*co).context;
        // Unwinding across a frame switch is impossible, so a panicking
        // action takes the process down.
        let result = panic::catch_unwind(AssertUnwindSafe(|| action(context, arg)))
            .unwrap_or_else(|_| {
                tracing::error!("coroutine action panicked; aborting");
                process::abort()
            });

        let parent = (*co).parent;
        (*co).dead = true;
        (*parent).defunct = co;
        let _ = Cothread {
            co: NonNull::new_unchecked(parent),
        }
        .switch(result);
    }
    // The final switch never returns.
    process::abort()
}

/// Reclaims a defunct coroutine and releases its share of the stack.
unsafe fn delete_coroutine(co: *mut Coroutine) {
    // Safety: only called from the switch epilogue with a coroutine whose
    // action has returned, on the owning thread
    unsafe {
        let stack = (*co).stack;
        (*stack).ref_count -= 1;
        if (*stack).ref_count == 0 {
            drop(Box::from_raw(stack));
        } else if (*stack).current == co {
            (*stack).current = ptr::null_mut();
        }
        drop(Box::from_raw(co));
    }
    tracing::trace!("reclaimed defunct coroutine");
}

#[cfg(test)]
impl Cothread {
    /// Number of live coroutines mapped to this coroutine's stack.
    pub(crate) fn stack_ref_count(self) -> usize {
        // Safety: test-only accessor on a live handle
        unsafe { (*(*self.co.as_ptr()).stack).ref_count }
    }

    /// Length of the saved shared-stack image.
    pub(crate) fn saved_image_len(self) -> usize {
        // Safety: test-only accessor on a live handle
        unsafe { (*self.co.as_ptr()).saved.len() }
    }
}
