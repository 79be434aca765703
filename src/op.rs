//! Per-operation control blocks.
//!
//! Every submission entry pushed to the ring carries the slab index of an
//! [`OpCtx`] as its `user_data`; the completion dispatcher maps the CQE
//! back through that index to the waiting fiber. The context also pins
//! whatever memory the kernel may touch while the operation is in flight.
//!
//! Reference counting: an awaited context starts at 2 (one share for the
//! kernel submission, one for the fiber). The dispatcher drops the kernel
//! share when the completion arrives, the fiber drops its own share when
//! it resumes. Whichever release reaches zero frees the slot and its
//! pinned buffers — so a context survives a cancelled fiber exactly until
//! the kernel's cancellation echo shows up, and survives a torn-down
//! submission exactly until the fiber has looked at the result. Chains
//! take one kernel share per linked entry; multishot contexts use the
//! [`MULTISHOT`] sentinel and are only freed when the kernel clears the
//! MORE flag.

use slab::Slab;

use crate::buf::Buffer;
use crate::error::Token;
use crate::fiber::FiberId;

/// Marks a context that may be completed many times (multishot accept).
pub(crate) const MULTISHOT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Poll,
    Read,
    Write,
    Writev,
    Recv,
    RecvMsg,
    Send,
    SendMsg,
    Accept,
    MultishotAccept,
    Connect,
    Splice,
    Tee,
    Timeout,
    Chain,
    Cancel,
    Close,
}

/// Self-contained storage for a `msghdr`-based operation. Boxed so the
/// pointers wired into `hdr` stay put for the lifetime of the op.
#[repr(C)]
pub(crate) struct MsgStorage {
    pub hdr: libc::msghdr,
    pub iov: libc::iovec,
    pub addr: libc::sockaddr_storage,
}

impl MsgStorage {
    pub fn boxed() -> Box<MsgStorage> {
        // all-zero is a valid initial state for every field
        unsafe { Box::new(std::mem::zeroed()) }
    }
}

/// A socket address handed to `connect`/`sendmsg`, pinned for the kernel.
#[repr(C)]
pub(crate) struct SockAddrStorage {
    pub addr: libc::sockaddr_storage,
    pub len: libc::socklen_t,
}

/// One pinned resource: anything the kernel reads or writes while the op
/// is in flight.
pub(crate) enum OpBuf {
    Data(Buffer),
    IoVec(Box<[libc::iovec]>),
    Msg(Box<MsgStorage>),
    Addr(Box<SockAddrStorage>),
    Ts(Box<io_uring::types::Timespec>),
}

/// Pinned-resource list with an inline fast path: almost every operation
/// pins zero or one resource, vectored ops spill into a heap list.
pub(crate) enum BufList {
    Empty,
    One(OpBuf),
    Many(Vec<OpBuf>),
}

impl BufList {
    fn push(&mut self, buf: OpBuf) {
        match std::mem::replace(self, BufList::Empty) {
            BufList::Empty => *self = BufList::One(buf),
            BufList::One(first) => *self = BufList::Many(vec![first, buf]),
            BufList::Many(mut list) => {
                list.push(buf);
                *self = BufList::Many(list);
            }
        }
    }
}

pub(crate) struct OpCtx {
    pub kind: OpKind,
    pub rc: u32,
    pub fiber: Option<FiberId>,
    /// Raw kernel result; accumulates transferred bytes for chains.
    pub result: i32,
    /// First failing errno of a chain (negative), 0 when clean.
    pub chain_err: i32,
    /// Deadline sentinel: when set, the completion wakes the owner with
    /// `Error::TimedOut(token)` instead of the raw result.
    pub token: Option<Token>,
    pub bufs: BufList,
}

/// Slab-backed store of op contexts; the slab index doubles as the ring
/// `user_data`.
#[derive(Default)]
pub(crate) struct OpStore {
    ops: Slab<OpCtx>,
}

impl OpStore {
    /// Context for an awaited operation: kernel share + fiber share.
    pub fn acquire(&mut self, kind: OpKind, fiber: FiberId) -> usize {
        self.insert(kind, 2, Some(fiber))
    }

    /// Ownerless fire-and-forget context (async-cancel, eventfd reads).
    pub fn acquire_bare(&mut self, kind: OpKind) -> usize {
        self.insert(kind, 1, None)
    }

    /// Context completed once per linked entry plus the fiber share.
    pub fn acquire_chain(&mut self, fiber: FiberId, links: u32) -> usize {
        self.insert(OpKind::Chain, links + 1, Some(fiber))
    }

    /// Context the kernel may complete many times; freed explicitly.
    pub fn acquire_multishot(&mut self, kind: OpKind) -> usize {
        self.insert(kind, MULTISHOT, None)
    }

    fn insert(&mut self, kind: OpKind, rc: u32, fiber: Option<FiberId>) -> usize {
        self.ops.insert(OpCtx {
            kind,
            rc,
            fiber,
            result: 0,
            chain_err: 0,
            token: None,
            bufs: BufList::Empty,
        })
    }

    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        self.ops.contains(idx)
    }

    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> &mut OpCtx {
        &mut self.ops[idx]
    }

    pub fn attach(&mut self, idx: usize, buf: OpBuf) {
        self.ops[idx].bufs.push(buf);
    }

    /// Drop one share. Returns `true` when the context was freed (and all
    /// pinned resources with it).
    pub fn release(&mut self, idx: usize) -> bool {
        let ctx = &mut self.ops[idx];
        debug_assert!(ctx.rc > 0 && ctx.rc != MULTISHOT);
        ctx.rc -= 1;
        if ctx.rc == 0 {
            self.ops.remove(idx);
            true
        } else {
            false
        }
    }

    /// Free a multishot context once the kernel reported the final
    /// completion.
    pub fn release_multishot(&mut self, idx: usize) {
        debug_assert_eq!(self.ops[idx].rc, MULTISHOT);
        self.ops.remove(idx);
    }

    /// Re-arm an existing context for one more kernel submission; used by
    /// the chunked-splice sequence, which funnels many steps through one
    /// context.
    pub fn rearm(&mut self, idx: usize) {
        let ctx = &mut self.ops[idx];
        debug_assert_eq!(ctx.rc, 1);
        ctx.rc = 2;
    }

    /// Contexts currently alive; the leak check of the test-suite.
    pub fn outstanding(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_discipline_frees_at_zero() {
        let mut store = OpStore::default();
        let idx = store.acquire(OpKind::Read, 1);
        assert_eq!(store.outstanding(), 1);

        assert!(!store.release(idx)); // kernel share
        assert!(store.release(idx)); // fiber share
        assert_eq!(store.outstanding(), 0);
    }

    #[test]
    fn chain_takes_a_share_per_link() {
        let mut store = OpStore::default();
        let idx = store.acquire_chain(1, 3);
        for _ in 0..3 {
            assert!(!store.release(idx));
        }
        assert!(store.release(idx));
    }

    #[test]
    fn pinned_buffers_live_until_the_last_share() {
        let mut store = OpStore::default();
        let buf = Buffer::from("payload");
        let idx = store.acquire(OpKind::Write, 1);
        store.attach(idx, OpBuf::Data(buf.clone()));

        assert!(!store.release(idx));
        // the context still pins the data
        assert_eq!(buf.len(), 7);
        assert!(store.release(idx));
        assert_eq!(store.outstanding(), 0);
    }

    #[test]
    fn buf_list_spills_past_one_entry() {
        let mut list = BufList::Empty;
        list.push(OpBuf::Data(Buffer::new()));
        assert!(matches!(list, BufList::One(_)));
        list.push(OpBuf::Data(Buffer::new()));
        list.push(OpBuf::Data(Buffer::new()));
        match list {
            BufList::Many(v) => assert_eq!(v.len(), 3),
            _ => panic!("expected spill"),
        }
    }
}
