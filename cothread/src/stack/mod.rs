//! Stack regions and their accounting.
//!
//! A [`StackRegion`] is the contiguous buffer one or more coroutines run
//! on. It records which coroutine's live frame currently occupies it and
//! how many coroutines are mapped to it; the region is released when the
//! last of them goes away. The base stack wrapping the original thread
//! stack is a degenerate region with no owned memory.

use crate::arch::STACK_ALIGNMENT;
use crate::runtime::Coroutine;
use crate::utils::round_up;
use core::ptr;
use std::io;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub(crate) use unix::page_size;
        use unix::StackMapping;
    } else {
        compile_error!("Unsupported target OS");
    }
}

pub(crate) mod valgrind;

use valgrind::ValgrindStackRegistration;

/// Minimum size of a stack, excluding guard pages.
pub const MIN_STACK_SIZE: usize = 4096;

/// Byte used to pre-fill check-patterned stacks for high-water accounting.
const CHECK_PATTERN: u8 = 0xC5;

pub(crate) struct StackRegion {
    /// Address of the non-overflow end; frames grow downward from here.
    pub base: usize,
    /// Usable byte length, excluding guard pages. 0 for the base stack.
    pub size: usize,
    /// Whether the usable region was pre-filled with [`CHECK_PATTERN`].
    pub check_pattern: bool,
    /// The coroutine whose live frame occupies this stack, or null when
    /// every user is saved or defunct. Not an ownership edge.
    pub current: *mut Coroutine,
    /// Number of live coroutines mapped to this stack.
    pub ref_count: usize,
    /// Owned memory; `None` for the base stack.
    mapping: Option<StackMapping>,
    valgrind: Option<ValgrindStackRegistration>,
}

impl StackRegion {
    /// Allocates a fresh region initially owned by `owner` alone.
    pub fn allocate(
        owner: *mut Coroutine,
        stack_size: usize,
        check_pattern: bool,
        guard_pages: usize,
    ) -> io::Result<Box<StackRegion>> {
        // Apply minimum stack size, then align either to the minimum stack
        // alignment or to pages when guard pages were requested.
        let stack_size = stack_size.max(MIN_STACK_SIZE);
        let page_size = page_size();
        let alignment = if guard_pages > 0 { page_size } else { STACK_ALIGNMENT };
        let stack_size = round_up(stack_size, alignment);
        let guard_size = guard_pages * page_size;

        let mapping = StackMapping::new(stack_size, guard_size)?;
        let base = mapping.top();

        if check_pattern {
            // Safety: [base - stack_size, base) lies within the read/write
            // part of the fresh mapping
            unsafe {
                ptr::write_bytes((base - stack_size) as *mut u8, CHECK_PATTERN, stack_size);
            }
        }

        let valgrind = ValgrindStackRegistration::new(mapping.bottom() as *mut u8, mapping.len());

        tracing::trace!(stack_size, guard_size, check_pattern, "allocated stack");
        Ok(Box::new(StackRegion {
            base,
            size: stack_size,
            check_pattern,
            current: owner,
            ref_count: 1,
            mapping: Some(mapping),
            valgrind: Some(valgrind),
        }))
    }

    /// Wraps the original thread stack. `probe` is an address within the
    /// caller's live frame; everything above it is treated as exclusive to
    /// the base coroutine and everything below as shared.
    pub fn base_stack(owner: *mut Coroutine, probe: usize) -> Box<StackRegion> {
        Box::new(StackRegion {
            base: probe & !(STACK_ALIGNMENT - 1),
            size: 0,
            check_pattern: false,
            current: owner,
            ref_count: 1,
            mapping: None,
            valgrind: None,
        })
    }

    /// High-water mark of a check-patterned stack: the deepest byte ever
    /// overwritten, found by scanning for the first non-pattern byte from
    /// the overflow end.
    pub fn high_water(&self) -> usize {
        for depth in (0..self.size).rev() {
            // Safety: [base - size, base) is mapped read/write
            let byte = unsafe { *((self.base - depth - 1) as *const u8) };
            if byte != CHECK_PATTERN {
                return depth + 1;
            }
        }
        0
    }

    /// Length of the frame bounded by this stack's base and `frame`.
    /// Negative when the frame sits above the base, which only the base
    /// stack can produce.
    #[expect(clippy::cast_possible_wrap, reason = "stack addresses fit in isize")]
    pub fn frame_length(&self, frame: usize) -> isize {
        self.base as isize - frame as isize
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        debug_assert_eq!(self.ref_count, 0);
        if self.mapping.is_some() && self.check_pattern {
            tracing::debug!(
                used = self.high_water(),
                size = self.size,
                "releasing check-patterned stack"
            );
        }
        // Deregister from valgrind before the memory goes away.
        self.valgrind.take();
        self.mapping.take();
    }
}
