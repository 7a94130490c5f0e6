// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::utils::round_up;
use core::ptr;
use std::io::Error;
use std::sync::OnceLock;

/// An anonymous mapping used as a coroutine stack. Guard pages, when
/// requested, sit at the low (overflow) end and are kept `PROT_NONE` for
/// the life of the mapping.
pub(crate) struct StackMapping {
    ptr: *mut u8,
    len: usize,
    guard_len: usize,
}

impl StackMapping {
    /// Maps `stack_size` usable bytes preceded by `guard_size` bytes of
    /// no-access guard. Both must already be aligned as the caller needs;
    /// the total is rounded up to whole pages.
    pub fn new(stack_size: usize, guard_size: usize) -> std::io::Result<Self> {
        let len = round_up(
            stack_size
                .checked_add(guard_size)
                .expect("integer overflow while calculating stack size"),
            page_size(),
        );

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping, no fd or address requirements
        unsafe {
            // Reserve address space with everything inaccessible, then open
            // up the part above the guard. If the mprotect call fails the
            // mapping is dropped and unmapped again.
            let mmap = libc::mmap(ptr::null_mut(), len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            let out = Self {
                ptr: mmap.cast::<u8>(),
                len,
                guard_len: guard_size,
            };

            if libc::mprotect(
                mmap.cast::<u8>().add(guard_size).cast::<libc::c_void>(),
                len - guard_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Highest address of the mapping; stacks grow downward from here.
    pub fn top(&self) -> usize {
        self.ptr as usize + self.len
    }

    /// Lowest address of the mapping, including any guard.
    pub fn bottom(&self) -> usize {
        self.ptr as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for StackMapping {
    fn drop(&mut self) {
        // Safety: the mapping covers exactly [ptr, ptr + len)
        unsafe {
            if self.guard_len > 0 {
                // Return the guard to read/write so the whole region is
                // uniform again before it goes back to the OS.
                let ret = libc::mprotect(
                    self.ptr.cast::<libc::c_void>(),
                    self.guard_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                );
                debug_assert_eq!(ret, 0);
            }
            let ret = libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
            debug_assert_eq!(ret, 0);
        }
    }
}

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

pub(crate) fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        // Safety: sysconf has no preconditions
        let pagesize = usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) })
            .expect("invalid page size");
        assert!(pagesize.is_power_of_two());
        pagesize
    })
}
