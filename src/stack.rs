//! Fiber stacks.
//!
//! Each fiber runs on a private anonymous mapping with a `PROT_NONE` guard
//! page below it, so a runaway fiber faults instead of silently corrupting
//! a neighbour. Dead fibers give their stacks back to a pool in the
//! runtime; allocation only hits `mmap` when the pool is dry.

use std::io;
use std::ptr;

use once_cell::sync::Lazy;

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

/// Default usable stack size for a fiber. Generous because fibers run
/// ordinary synchronous Rust code, not hand-trimmed coroutine bodies.
pub(crate) const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// One mmap'd fiber stack: a guard page at the low end plus `size` usable
/// bytes above it. Stack addresses grow downwards from [`Stack::top`].
pub(crate) struct Stack {
    base: *mut u8,
    len: usize,
}

impl Stack {
    pub(crate) fn new(size: usize) -> io::Result<Stack> {
        let page = *PAGE_SIZE;
        let usable = (size + page - 1) / page * page;
        let len = usable + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // guard page at the low end
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(err);
        }

        Ok(Stack {
            base: base as *mut u8,
            len,
        })
    }

    /// Highest address of the usable region, 16-byte aligned as every
    /// supported ABI requires.
    #[inline]
    pub(crate) fn top(&self) -> *mut u8 {
        let top = self.base as usize + self.len;
        (top & !15) as *mut u8
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}
