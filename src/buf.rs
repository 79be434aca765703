//! Byte buffers whose allocation can be pinned by an in-flight kernel
//! operation.
//!
//! A [`Buffer`] is a growable byte vector behind a cheap refcounted handle.
//! When the backend pushes a submission entry that reads from or writes
//! into a buffer, it attaches a clone of the handle to the operation's
//! context; the allocation then stays alive until the kernel's completion
//! arrives, even if the awaiting fiber was cancelled and its stack frame is
//! long gone.
//!
//! The runtime is single-threaded and a fiber that handed a buffer to the
//! kernel is suspended until the operation settles, so the interior
//! mutability here is never observed concurrently with a kernel access.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Growable byte buffer shared between a fiber and the ring backend.
#[derive(Clone, Default)]
pub struct Buffer {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl Buffer {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_capacity(cap: usize) -> Self {
        Buffer {
            bytes: Rc::new(RefCell::new(Vec::with_capacity(cap))),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.borrow().is_empty()
    }

    /// Drop the contents, keeping the allocation.
    #[inline]
    pub fn clear(&self) {
        self.bytes.borrow_mut().clear();
    }

    /// Copy of the current contents.
    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.borrow().clone()
    }

    pub fn extend_from_slice(&self, data: &[u8]) {
        self.bytes.borrow_mut().extend_from_slice(data);
    }

    /// Run `f` over the current contents without copying them out.
    #[inline]
    pub fn with_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.borrow())
    }

    /// Grow the allocation so that at least `cap` bytes fit.
    pub(crate) fn grow_to(&self, cap: usize) {
        let mut bytes = self.bytes.borrow_mut();
        let len = bytes.len();
        if cap > len {
            bytes.reserve(cap - len);
        }
    }

    /// Pointer to the byte at `off`. `off` must be within the current
    /// capacity; the pointer stays valid until the vector is grown again.
    pub(crate) fn raw_at(&self, off: usize) -> *mut u8 {
        let mut bytes = self.bytes.borrow_mut();
        debug_assert!(off <= bytes.capacity());
        unsafe { bytes.as_mut_ptr().add(off) }
    }

    /// Pointer/length pair over the initialized contents.
    pub(crate) fn raw_parts(&self) -> (*const u8, usize) {
        let bytes = self.bytes.borrow();
        (bytes.as_ptr(), bytes.len())
    }

    /// Declare `len` bytes initialized after the kernel wrote into the
    /// spare capacity.
    ///
    /// # Safety
    /// The first `len` bytes of the allocation must actually have been
    /// written.
    pub(crate) unsafe fn set_len(&self, len: usize) {
        let mut bytes = self.bytes.borrow_mut();
        debug_assert!(len <= bytes.capacity());
        bytes.set_len(len);
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Buffer {
            bytes: Rc::new(RefCell::new(bytes)),
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        data.to_vec().into()
    }
}

impl From<&str> for Buffer {
    fn from(data: &str) -> Self {
        data.as_bytes().into()
    }
}

impl PartialEq<[u8]> for Buffer {
    fn eq(&self, other: &[u8]) -> bool {
        *self.bytes.borrow() == other
    }
}

impl PartialEq<&[u8]> for Buffer {
    fn eq(&self, other: &&[u8]) -> bool {
        *self.bytes.borrow() == *other
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.bytes.borrow();
        write!(f, "Buffer({} bytes)", bytes.len())
    }
}
