// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::Error;
use std::ptr;

use crate::stack::{FiberStack, MIN_STACK_SIZE, StackPointer};

/// An `mmap`-backed stack whose lowest page has its access revoked, so
/// overflow faults instead of silently corrupting adjacent memory.
pub struct DefaultFiberStack {
    /// Lowest address of the mapping (the guard page).
    base: *mut u8,
    /// Whole mapping length, guard page included.
    len: usize,
}

impl DefaultFiberStack {
    /// Creates a new stack with at least `size` usable bytes.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);

        // Whole pages only, plus one extra page to sacrifice as the
        // guard.
        let page = page_size();
        let len = size
            .checked_next_multiple_of(page)
            .expect("integer overflow while calculating stack size")
            + page;

        // Safety: fresh anonymous mapping; every syscall result is
        // checked before use.
        unsafe {
            let base = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }
            let base = base.cast::<u8>();

            // Revoke the bottom page.
            if libc::mprotect(base.cast(), page, libc::PROT_NONE) != 0 {
                let err = Error::last_os_error();
                libc::munmap(base.cast(), len);
                return Err(err);
            }

            Ok(Self { base, len })
        }
    }
}

impl Default for DefaultFiberStack {
    fn default() -> Self {
        Self::new(1024 * 1024).expect("failed to allocate stack")
    }
}

impl Drop for DefaultFiberStack {
    fn drop(&mut self) {
        // Safety: we own the mapping and nothing is executing on it (the
        // owning fiber asserts completion before releasing the stack).
        unsafe {
            let ret = libc::munmap(self.base.cast(), self.len);
            debug_assert_eq!(ret, 0);
        }
    }
}

// Safety: both ends are page-aligned (which satisfies STACK_ALIGNMENT)
// and the mapping stays valid for the lifetime of the value. The `as`
// casts expose the mapping's provenance for the stack-image writers.
unsafe impl FiberStack for DefaultFiberStack {
    fn top(&self) -> StackPointer {
        StackPointer::new(self.base as usize + self.len).unwrap()
    }

    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.base as usize).unwrap()
    }
}

// Safety: the stack is plain memory; exclusive use is enforced by the
// fiber running on it, not by the allocation.
unsafe impl Send for DefaultFiberStack {}

fn page_size() -> usize {
    // Safety: sysconf with a valid name has no preconditions.
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pagesize = usize::try_from(pagesize).expect("invalid page size");
    assert!(pagesize.is_power_of_two());
    pagesize
}
