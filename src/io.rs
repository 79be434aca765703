//! The operation catalogue.
//!
//! Every function here follows the same submission discipline: obtain an
//! op context, fill a submission entry whose `user_data` is the context
//! index, pin whatever memory the kernel will touch, defer-submit, then
//! yield. The completion dispatcher wakes the fiber with the kernel's
//! result; a cancellation arriving instead triggers the async-cancel
//! protocol and the context outlives the fiber's interest until the
//! kernel's echo arrives.
//!
//! I/O handles are anything that resolves to a Unix file descriptor via
//! [`AsRawFd`]. Descriptors passed in are borrowed for the duration of the
//! operation and never closed here; descriptors produced by `accept` come
//! back owned, wrapped in [`RingStream`](crate::net::RingStream).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;

use bitflags::bitflags;
use io_uring::{opcode, squeue, types};

use crate::buf::Buffer;
use crate::error::{check_result, Error, Result, Token};
use crate::net::RingStream;
use crate::op::{MsgStorage, OpBuf, OpKind, SockAddrStorage};
use crate::ring::Backlog;
use crate::runtime::{self, Runtime, Wake};

/// Offset value meaning "use the descriptor's file position" (-1).
const NO_OFFSET: u64 = u64::MAX;

/// Chunk size for splice-to-EOF loops and the double-splice pipe.
const SPLICE_CHUNK: u32 = 1 << 16;

bitflags! {
    /// Readiness interests for [`wait_io`].
    pub struct Interest: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

////////////////////////////////////////////////////////////////////////////////
// Submission plumbing
////////////////////////////////////////////////////////////////////////////////

/// Push an entry, yielding while the submission queue is saturated.
fn push_entry(entry: &squeue::Entry) -> Result<()> {
    loop {
        let pushed = runtime::with(|rt| rt.ring.try_push(entry))?;
        if pushed {
            return Ok(());
        }
        // ring full even after a flush: reap completions to make room,
        // then take our place at the back of the line
        runtime::with(|rt| {
            let Runtime {
                ring,
                fibers,
                run_queue,
                ..
            } = rt;
            ring.poll(false, fibers, run_queue)
        })?;
        crate::fiber::yield_now()?;
    }
}

/// Acquire a context owned by the current fiber, pin `pins`, push the
/// entry. On any failure nothing stays submitted and the context is gone.
pub(crate) fn prepare(
    kind: OpKind,
    entry: squeue::Entry,
    pins: Vec<OpBuf>,
    token: Option<Token>,
) -> Result<usize> {
    let idx = runtime::with(|rt| {
        let me = rt.current.expect("io operation outside of a fiber");
        let idx = rt.ring.store.acquire(kind, me);
        rt.ring.store.get_mut(idx).token = token;
        for pin in pins {
            rt.ring.store.attach(idx, pin);
        }
        idx
    });
    let entry = entry.user_data(idx as u64);
    if let Err(e) = push_entry(&entry) {
        runtime::with(|rt| {
            rt.ring.store.release(idx);
            rt.ring.store.release(idx);
        });
        return Err(e);
    }
    Ok(idx)
}

/// Wait for the completion of `idx`.
///
/// On a normal completion the dispatcher has already dropped the kernel
/// share; this drops the fiber share (unless `keep_share`, used when the
/// caller still needs the pinned storage or wants to reuse the context)
/// and maps the raw result.
///
/// On an interrupting error (cancellation, deadline) the context is
/// disowned and released; if the kernel still holds a share an
/// async-cancel chases the in-flight operation, and the context together
/// with its pinned buffers survives until the echo.
pub(crate) fn await_op(idx: usize, keep_share: bool) -> Result<i32> {
    loop {
        match runtime::suspend() {
            Ok(Wake::Op(res)) => {
                if !keep_share {
                    runtime::with(|rt| {
                        rt.ring.store.release(idx);
                    });
                }
                return check_result(res);
            }
            // a wakeup meant for somebody else's protocol (timer tick,
            // stray `Fiber::wakeup`); the op is still in flight
            Ok(_) => continue,
            Err(e) => {
                runtime::with(|rt| {
                    rt.ring.store.get_mut(idx).fiber = None;
                    let freed = rt.ring.store.release(idx);
                    if !freed {
                        rt.ring.submit_cancel(idx);
                    }
                });
                return Err(e);
            }
        }
    }
}

/// Awaited sequence sharing one context across many submissions
/// (the chunked-splice primitive). Keeps the fiber share between steps,
/// re-arming the kernel share per submission.
struct SeqCtx {
    idx: usize,
    started: bool,
    alive: bool,
}

impl SeqCtx {
    fn acquire(kind: OpKind) -> SeqCtx {
        let idx = runtime::with(|rt| {
            let me = rt.current.expect("io operation outside of a fiber");
            rt.ring.store.acquire(kind, me)
        });
        SeqCtx {
            idx,
            started: false,
            alive: true,
        }
    }

    fn pin(&self, buf: OpBuf) {
        runtime::with(|rt| rt.ring.store.attach(self.idx, buf));
    }

    fn run(&mut self, entry: squeue::Entry) -> Result<i32> {
        debug_assert!(self.alive);
        if self.started {
            runtime::with(|rt| rt.ring.store.rearm(self.idx));
        }
        self.started = true;
        let entry = entry.user_data(self.idx as u64);
        if let Err(e) = push_entry(&entry) {
            self.alive = false;
            runtime::with(|rt| {
                rt.ring.store.release(self.idx);
                rt.ring.store.release(self.idx);
            });
            return Err(e);
        }
        match await_op(self.idx, true) {
            Ok(res) => Ok(res),
            Err(e) => {
                // await_op already released the share and chased the op
                self.alive = false;
                Err(e)
            }
        }
    }

    fn finish(mut self) {
        if self.alive {
            self.alive = false;
            runtime::with(|rt| {
                rt.ring.store.release(self.idx);
            });
        }
    }
}

impl Drop for SeqCtx {
    fn drop(&mut self) {
        if self.alive {
            let _ = runtime::try_with(|rt| {
                rt.ring.store.release(self.idx);
            });
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Read side
////////////////////////////////////////////////////////////////////////////////

/// Read from `io` into `buf`.
///
/// - `maxlen` - bytes per kernel read
/// - `to_eof` - keep reading (growing the buffer) until end of stream
/// - `pos` - write offset into the buffer; `None` appends at the end
///
/// Returns the number of bytes added, or `None` when the source hit end
/// of stream before delivering anything. A `maxlen` of zero returns
/// without submitting an operation.
pub fn read(
    io: &impl AsRawFd,
    buf: &Buffer,
    maxlen: usize,
    to_eof: bool,
    pos: Option<usize>,
) -> Result<Option<usize>> {
    if maxlen == 0 {
        return Ok(Some(0));
    }
    let fd = io.as_raw_fd();
    let start = match pos {
        Some(p) if p > buf.len() => {
            return Err(Error::InvalidArgument("read position beyond buffer end"))
        }
        Some(p) => p,
        None => buf.len(),
    };
    let mut total = 0usize;
    loop {
        buf.grow_to(start + total + maxlen);
        let ptr = buf.raw_at(start + total);
        let entry = opcode::Read::new(types::Fd(fd), ptr, maxlen as u32)
            .offset(NO_OFFSET)
            .build();
        let idx = prepare(OpKind::Read, entry, vec![OpBuf::Data(buf.clone())], None)?;
        let n = await_op(idx, false)? as usize;
        if n == 0 {
            break;
        }
        total += n;
        if start + total > buf.len() {
            unsafe { buf.set_len(start + total) };
        }
        if !to_eof {
            return Ok(Some(total));
        }
    }
    if total == 0 {
        Ok(None)
    } else {
        Ok(Some(total))
    }
}

/// Invoke `f` once per chunk read from `io`; returns cleanly at end of
/// stream.
pub fn read_loop(
    io: &impl AsRawFd,
    chunk_size: usize,
    mut f: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    let buf = Buffer::with_capacity(chunk_size);
    loop {
        buf.clear();
        match read(io, &buf, chunk_size, false, None)? {
            None => return Ok(()),
            Some(_) => buf.with_slice(|chunk| f(chunk))?,
        }
    }
}

/// Receive from a socket into `buf` (appended). `None` means the peer
/// shut the stream down before sending anything.
pub fn recv(io: &impl AsRawFd, buf: &Buffer, maxlen: usize) -> Result<Option<usize>> {
    if maxlen == 0 {
        return Ok(Some(0));
    }
    let fd = io.as_raw_fd();
    let start = buf.len();
    buf.grow_to(start + maxlen);
    let ptr = buf.raw_at(start);
    let entry = opcode::Recv::new(types::Fd(fd), ptr, maxlen as u32).build();
    let idx = prepare(OpKind::Recv, entry, vec![OpBuf::Data(buf.clone())], None)?;
    let n = await_op(idx, false)? as usize;
    if n == 0 {
        return Ok(None);
    }
    unsafe { buf.set_len(start + n) };
    Ok(Some(n))
}

/// `recv` analogue of [`read_loop`].
pub fn recv_loop(
    io: &impl AsRawFd,
    chunk_size: usize,
    mut f: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    let buf = Buffer::with_capacity(chunk_size);
    loop {
        buf.clear();
        match recv(io, &buf, chunk_size)? {
            None => return Ok(()),
            Some(_) => buf.with_slice(|chunk| f(chunk))?,
        }
    }
}

/// `recvmsg(2)` over the ring: one datagram (or stream chunk) appended to
/// `buf`, plus the sender's address when the socket provides one.
pub fn recvmsg(
    io: &impl AsRawFd,
    buf: &Buffer,
    maxlen: usize,
    flags: u32,
) -> Result<(Option<usize>, Option<SocketAddr>)> {
    if maxlen == 0 {
        return Ok((Some(0), None));
    }
    let fd = io.as_raw_fd();
    let start = buf.len();
    buf.grow_to(start + maxlen);

    let mut msg = MsgStorage::boxed();
    msg.iov = libc::iovec {
        iov_base: buf.raw_at(start) as *mut libc::c_void,
        iov_len: maxlen,
    };
    msg.hdr.msg_iov = &mut msg.iov;
    msg.hdr.msg_iovlen = 1;
    msg.hdr.msg_name = &mut msg.addr as *mut libc::sockaddr_storage as *mut libc::c_void;
    msg.hdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let hdr_ptr: *mut libc::msghdr = &mut msg.hdr;
    // the storage is pinned by the context; the raw pointer stays valid
    // for as long as we hold our share
    let msg_ptr: *const MsgStorage = &*msg;

    let entry = opcode::RecvMsg::new(types::Fd(fd), hdr_ptr)
        .flags(flags)
        .build();
    let idx = prepare(
        OpKind::RecvMsg,
        entry,
        vec![OpBuf::Data(buf.clone()), OpBuf::Msg(msg)],
        None,
    )?;
    let n = await_op(idx, true)? as usize;
    let addr = unsafe {
        let stored = &*msg_ptr;
        sockaddr_to_std(&stored.addr, stored.hdr.msg_namelen)
    };
    runtime::with(|rt| {
        rt.ring.store.release(idx);
    });
    if n == 0 {
        return Ok((None, addr));
    }
    unsafe { buf.set_len(start + n) };
    Ok((Some(n), addr))
}

////////////////////////////////////////////////////////////////////////////////
// Write side
////////////////////////////////////////////////////////////////////////////////

/// Write the whole buffer to `io`, resubmitting on partial writes.
/// Returns the number of bytes written.
pub fn write(io: &impl AsRawFd, buf: &Buffer) -> Result<usize> {
    let fd = io.as_raw_fd();
    let len = buf.len();
    let mut written = 0usize;
    while written < len {
        let ptr = buf.raw_at(written) as *const u8;
        let entry = opcode::Write::new(types::Fd(fd), ptr, (len - written) as u32)
            .offset(NO_OFFSET)
            .build();
        let idx = prepare(OpKind::Write, entry, vec![OpBuf::Data(buf.clone())], None)?;
        let n = await_op(idx, false)? as usize;
        if n == 0 {
            break;
        }
        written += n;
    }
    Ok(written)
}

/// Gathering write: indistinguishable to the reader from writing the
/// concatenation of `bufs`. Loops on partial writes.
pub fn writev(io: &impl AsRawFd, bufs: &[Buffer]) -> Result<usize> {
    let fd = io.as_raw_fd();
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    let mut written = 0usize;
    while written < total {
        let mut skip = written;
        let mut iovs: Vec<libc::iovec> = Vec::with_capacity(bufs.len());
        let mut pins: Vec<OpBuf> = Vec::with_capacity(bufs.len() + 1);
        for buf in bufs {
            let (ptr, len) = buf.raw_parts();
            if skip >= len {
                skip -= len;
                continue;
            }
            iovs.push(libc::iovec {
                iov_base: unsafe { ptr.add(skip) } as *mut libc::c_void,
                iov_len: len - skip,
            });
            skip = 0;
            pins.push(OpBuf::Data(buf.clone()));
        }
        if iovs.is_empty() {
            break;
        }
        let iovs = iovs.into_boxed_slice();
        let entry = opcode::Writev::new(types::Fd(fd), iovs.as_ptr(), iovs.len() as u32)
            .offset(NO_OFFSET)
            .build();
        pins.push(OpBuf::IoVec(iovs));
        let idx = prepare(OpKind::Writev, entry, pins, None)?;
        let n = await_op(idx, false)? as usize;
        if n == 0 {
            break;
        }
        written += n;
    }
    Ok(written)
}

/// Send the whole buffer on a socket with the given `MSG_*` flags.
pub fn send(io: &impl AsRawFd, buf: &Buffer, flags: i32) -> Result<usize> {
    let fd = io.as_raw_fd();
    let len = buf.len();
    let mut sent = 0usize;
    while sent < len {
        let ptr = buf.raw_at(sent) as *const u8;
        let entry = opcode::Send::new(types::Fd(fd), ptr, (len - sent) as u32)
            .flags(flags)
            .build();
        let idx = prepare(OpKind::Send, entry, vec![OpBuf::Data(buf.clone())], None)?;
        let n = await_op(idx, false)? as usize;
        if n == 0 {
            break;
        }
        sent += n;
    }
    Ok(sent)
}

/// `sendmsg(2)` over the ring; `addr` targets an unconnected datagram
/// socket. One submission, no partial-write looping (datagram semantics).
pub fn sendmsg(
    io: &impl AsRawFd,
    buf: &Buffer,
    flags: u32,
    addr: Option<&SocketAddr>,
) -> Result<usize> {
    let fd = io.as_raw_fd();
    let (ptr, len) = buf.raw_parts();

    let mut msg = MsgStorage::boxed();
    msg.iov = libc::iovec {
        iov_base: ptr as *mut libc::c_void,
        iov_len: len,
    };
    msg.hdr.msg_iov = &mut msg.iov;
    msg.hdr.msg_iovlen = 1;
    if let Some(addr) = addr {
        let (storage, addr_len) = sockaddr_from_std(addr);
        msg.addr = storage;
        msg.hdr.msg_name = &mut msg.addr as *mut libc::sockaddr_storage as *mut libc::c_void;
        msg.hdr.msg_namelen = addr_len;
    }
    let hdr_ptr: *const libc::msghdr = &msg.hdr;

    let entry = opcode::SendMsg::new(types::Fd(fd), hdr_ptr)
        .flags(flags)
        .build();
    let idx = prepare(
        OpKind::SendMsg,
        entry,
        vec![OpBuf::Data(buf.clone()), OpBuf::Msg(msg)],
        None,
    )?;
    let n = await_op(idx, false)?;
    Ok(n as usize)
}

////////////////////////////////////////////////////////////////////////////////
// Accept / connect
////////////////////////////////////////////////////////////////////////////////

/// Accept one connection, yielding until a client arrives. When a
/// multishot accept is active on the listener, this pops its backlog
/// instead of submitting a fresh operation.
pub fn accept(io: &impl AsRawFd) -> Result<RingStream> {
    let fd = accept_raw(io.as_raw_fd())?;
    Ok(unsafe { RingStream::from_raw_fd(fd) })
}

/// Accept connections forever, invoking `f` for each. Exits only through
/// an error (cancellation included).
pub fn accept_loop(
    io: &impl AsRawFd,
    mut f: impl FnMut(RingStream) -> Result<()>,
) -> Result<std::convert::Infallible> {
    loop {
        let stream = accept(io)?;
        f(stream)?;
    }
}

enum BacklogPoll {
    Got(RawFd),
    Failed(i32),
    Parked,
    NoBacklog,
}

fn poll_backlog(server: RawFd) -> BacklogPoll {
    runtime::with(|rt| {
        let me = rt.current.expect("accept outside of a fiber");
        match rt.ring.backlogs.get_mut(&server) {
            Some(backlog) => {
                if let Some(fd) = backlog.ready.pop_front() {
                    BacklogPoll::Got(fd)
                } else if backlog.error != 0 {
                    let err = backlog.error;
                    backlog.error = 0;
                    BacklogPoll::Failed(err)
                } else {
                    backlog.waiter = Some(me);
                    BacklogPoll::Parked
                }
            }
            None => BacklogPoll::NoBacklog,
        }
    })
}

fn clear_backlog_waiter(server: RawFd) {
    runtime::with(|rt| {
        let me = rt.current.expect("accept outside of a fiber");
        if let Some(backlog) = rt.ring.backlogs.get_mut(&server) {
            if backlog.waiter == Some(me) {
                backlog.waiter = None;
            }
        }
    });
}

fn accept_raw(server: RawFd) -> Result<RawFd> {
    loop {
        match poll_backlog(server) {
            BacklogPoll::Got(fd) => return Ok(fd),
            BacklogPoll::Failed(err) => return check_result(err).map(|_| unreachable!()),
            BacklogPoll::Parked => match runtime::suspend() {
                Ok(_) => continue,
                Err(e) => {
                    clear_backlog_waiter(server);
                    return Err(e);
                }
            },
            BacklogPoll::NoBacklog => break,
        }
    }
    let entry = opcode::Accept::new(types::Fd(server), ptr::null_mut(), ptr::null_mut())
        .flags(libc::SOCK_CLOEXEC)
        .build();
    let idx = prepare(OpKind::Accept, entry, vec![], None)?;
    await_op(idx, false)
}

/// One multishot accept submission feeds a per-listener backlog that `f`
/// drains: the kernel keeps accepting while the fiber is busy handling a
/// connection. Exits only through an error; fds still queued when the
/// scope unwinds are closed, never leaked.
pub fn multishot_accept(
    io: &impl AsRawFd,
    mut f: impl FnMut(RingStream) -> Result<()>,
) -> Result<std::convert::Infallible> {
    let server = io.as_raw_fd();
    arm_multishot(server, true)?;

    let result = loop {
        match poll_backlog(server) {
            BacklogPoll::Got(fd) => {
                let stream = unsafe { RingStream::from_raw_fd(fd) };
                if let Err(e) = f(stream) {
                    break Err(e);
                }
            }
            BacklogPoll::Failed(err) => break check_result(err).map(|_| ()),
            BacklogPoll::Parked => {
                if let Err(e) = runtime::suspend() {
                    clear_backlog_waiter(server);
                    break Err(e);
                }
            }
            BacklogPoll::NoBacklog => {
                break Err(Error::InvalidArgument("multishot backlog disappeared"))
            }
        }
        // the kernel retires a multishot entry when the accept queue
        // overflows; re-arm and keep going
        if let Err(e) = arm_multishot(server, false) {
            break Err(e);
        }
    };

    teardown_multishot(server);
    result.map(|_| unreachable!("multishot accept loop cannot succeed"))
}

/// Submit the multishot entry. With `fresh` this also claims the backlog
/// slot; otherwise it only re-arms a retired entry.
fn arm_multishot(server: RawFd, fresh: bool) -> Result<()> {
    runtime::with(|rt| -> Result<()> {
        if fresh && rt.ring.backlogs.contains_key(&server) {
            return Err(Error::InvalidArgument(
                "listener already has a multishot accept",
            ));
        }
        if !fresh {
            match rt.ring.backlogs.get(&server) {
                Some(b) if b.ctx.is_some() => return Ok(()), // still armed
                Some(_) => {}
                None => return Err(Error::InvalidArgument("multishot backlog disappeared")),
            }
        }
        let idx = rt.ring.store.acquire_multishot(OpKind::MultishotAccept);
        let entry = opcode::AcceptMulti::new(types::Fd(server))
            .build()
            .user_data(idx as u64);
        match rt.ring.try_push(&entry) {
            Ok(true) => {
                if fresh {
                    rt.ring.backlogs.insert(
                        server,
                        Backlog {
                            ready: Default::default(),
                            waiter: None,
                            ctx: Some(idx),
                            live: true,
                            error: 0,
                        },
                    );
                } else {
                    rt.ring.backlogs.get_mut(&server).unwrap().ctx = Some(idx);
                }
                Ok(())
            }
            Ok(false) => {
                rt.ring.store.release_multishot(idx);
                Err(Error::IO(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "submission queue saturated",
                )))
            }
            Err(e) => {
                rt.ring.store.release_multishot(idx);
                Err(e)
            }
        }
    })
}

fn teardown_multishot(server: RawFd) {
    runtime::with(|rt| {
        let remove = match rt.ring.backlogs.get_mut(&server) {
            Some(backlog) => {
                backlog.live = false;
                backlog.waiter = None;
                for fd in backlog.ready.drain(..) {
                    unsafe { libc::close(fd) };
                }
                match backlog.ctx {
                    // the dispatcher removes the backlog when the final
                    // completion lands
                    Some(ctx) => {
                        rt.ring.submit_cancel(ctx);
                        false
                    }
                    None => true,
                }
            }
            None => false,
        };
        if remove {
            rt.ring.backlogs.remove(&server);
        }
    });
}

/// Connect a socket to `addr`, yielding until the handshake settles.
pub fn connect(io: &impl AsRawFd, addr: &SocketAddr) -> Result<()> {
    let fd = io.as_raw_fd();
    let (storage, len) = sockaddr_from_std(addr);
    let pinned = Box::new(SockAddrStorage { addr: storage, len });
    let addr_ptr = &pinned.addr as *const libc::sockaddr_storage as *const libc::sockaddr;
    let entry = opcode::Connect::new(types::Fd(fd), addr_ptr, pinned.len).build();
    let idx = prepare(OpKind::Connect, entry, vec![OpBuf::Addr(pinned)], None)?;
    await_op(idx, false)?;
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Splice family
////////////////////////////////////////////////////////////////////////////////

/// Move up to `maxlen` bytes from `src` to `dst` without copying through
/// user space (at least one side must be a pipe). A negative `maxlen`
/// splices until end of stream in chunks of `-maxlen`.
pub fn splice(src: &impl AsRawFd, dst: &impl AsRawFd, maxlen: i64) -> Result<usize> {
    if maxlen == 0 {
        return Err(Error::InvalidArgument("zero-length splice"));
    }
    let (src, dst) = (src.as_raw_fd(), dst.as_raw_fd());
    if maxlen > 0 {
        let n = splice_raw(src, dst, maxlen.min(u32::MAX as i64) as u32)?;
        return Ok(n as usize);
    }
    let chunk = (-maxlen).min(u32::MAX as i64) as u32;
    let mut total = 0usize;
    loop {
        let n = splice_raw(src, dst, chunk)?;
        if n == 0 {
            return Ok(total);
        }
        total += n as usize;
    }
}

fn splice_raw(src: RawFd, dst: RawFd, len: u32) -> Result<u32> {
    let entry = opcode::Splice::new(types::Fd(src), -1, types::Fd(dst), -1, len).build();
    let idx = prepare(OpKind::Splice, entry, vec![], None)?;
    Ok(await_op(idx, false)? as u32)
}

/// Duplicate up to `maxlen` bytes from pipe `src` into pipe `dst` without
/// consuming them.
pub fn tee(src: &impl AsRawFd, dst: &impl AsRawFd, maxlen: u32) -> Result<usize> {
    if maxlen == 0 {
        return Err(Error::InvalidArgument("zero-length tee"));
    }
    let entry = opcode::Tee::new(types::Fd(src.as_raw_fd()), types::Fd(dst.as_raw_fd()), maxlen)
        .build();
    let idx = prepare(OpKind::Tee, entry, vec![], None)?;
    Ok(await_op(idx, false)? as usize)
}

/// Internal pipe pair, closed on every exit path.
struct PipePair {
    r: RawFd,
    w: RawFd,
}

impl PipePair {
    fn new() -> Result<PipePair> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(PipePair {
            r: fds[0],
            w: fds[1],
        })
    }
}

impl Drop for PipePair {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.r);
            libc::close(self.w);
        }
    }
}

/// Splice `src` to `dst` through an internal pipe until end of stream,
/// allowing two non-pipe descriptors on either end. Returns the number of
/// bytes moved.
pub fn double_splice(src: &impl AsRawFd, dst: &impl AsRawFd) -> Result<usize> {
    let (src, dst) = (src.as_raw_fd(), dst.as_raw_fd());
    let pipe = PipePair::new()?;
    let mut total = 0usize;
    loop {
        let n = splice_raw(src, pipe.w, SPLICE_CHUNK)?;
        if n == 0 {
            return Ok(total);
        }
        let mut left = n;
        while left > 0 {
            let moved = splice_raw(pipe.r, dst, left)?;
            if moved == 0 {
                return Ok(total);
            }
            left -= moved;
            total += moved as usize;
        }
    }
}

/// Framed relay: write `prefix`, then per chunk spliced from `src`
/// optionally write `chunk_prefix(len)`, forward the chunk, optionally
/// write `chunk_postfix(len)`, and finish with `postfix`. The whole
/// sequence funnels through one op context; the internal pipe is closed
/// on every exit path. Returns the number of bytes written to `dst`.
#[allow(clippy::too_many_arguments)]
pub fn splice_chunks(
    src: &impl AsRawFd,
    dst: &impl AsRawFd,
    prefix: Option<&Buffer>,
    postfix: Option<&Buffer>,
    chunk_prefix: Option<&dyn Fn(usize) -> Buffer>,
    chunk_postfix: Option<&dyn Fn(usize) -> Buffer>,
    chunk_size: usize,
) -> Result<usize> {
    if chunk_size == 0 {
        return Err(Error::InvalidArgument("zero chunk size"));
    }
    let (src, dst) = (src.as_raw_fd(), dst.as_raw_fd());
    let pipe = PipePair::new()?;
    let mut seq = SeqCtx::acquire(OpKind::Splice);
    let mut total = 0usize;

    let write_step = |seq: &mut SeqCtx, buf: &Buffer| -> Result<usize> {
        let mut written = 0usize;
        let len = buf.len();
        while written < len {
            seq.pin(OpBuf::Data(buf.clone()));
            let ptr = buf.raw_at(written) as *const u8;
            let entry = opcode::Write::new(types::Fd(dst), ptr, (len - written) as u32)
                .offset(NO_OFFSET)
                .build();
            let n = seq.run(entry)? as usize;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    };
    let splice_step = |seq: &mut SeqCtx, from: RawFd, to: RawFd, len: u32| -> Result<u32> {
        let entry = opcode::Splice::new(types::Fd(from), -1, types::Fd(to), -1, len).build();
        seq.run(entry).map(|n| n as u32)
    };

    let result = (|| -> Result<usize> {
        if let Some(prefix) = prefix {
            total += write_step(&mut seq, prefix)?;
        }
        loop {
            let n = splice_step(&mut seq, src, pipe.w, chunk_size.min(u32::MAX as usize) as u32)?;
            if n == 0 {
                break;
            }
            if let Some(make) = chunk_prefix {
                total += write_step(&mut seq, &make(n as usize))?;
            }
            let mut left = n;
            while left > 0 {
                let moved = splice_step(&mut seq, pipe.r, dst, left)?;
                if moved == 0 {
                    break;
                }
                left -= moved;
                total += moved as usize;
            }
            if let Some(make) = chunk_postfix {
                total += write_step(&mut seq, &make(n as usize))?;
            }
        }
        if let Some(postfix) = postfix {
            total += write_step(&mut seq, postfix)?;
        }
        Ok(total)
    })();

    seq.finish();
    result
}

////////////////////////////////////////////////////////////////////////////////
// Chains
////////////////////////////////////////////////////////////////////////////////

/// One link of an atomic operation chain.
pub enum ChainOp<'a> {
    Write { fd: RawFd, buf: &'a Buffer },
    Send { fd: RawFd, buf: &'a Buffer, flags: i32 },
    Splice { src: RawFd, dst: RawFd, len: u32 },
}

impl<'a> ChainOp<'a> {
    pub fn write(io: &impl AsRawFd, buf: &'a Buffer) -> ChainOp<'a> {
        ChainOp::Write {
            fd: io.as_raw_fd(),
            buf,
        }
    }

    pub fn send(io: &impl AsRawFd, buf: &'a Buffer, flags: i32) -> ChainOp<'a> {
        ChainOp::Send {
            fd: io.as_raw_fd(),
            buf,
            flags,
        }
    }

    pub fn splice(src: &impl AsRawFd, dst: &impl AsRawFd, len: u32) -> ChainOp<'a> {
        ChainOp::Splice {
            src: src.as_raw_fd(),
            dst: dst.as_raw_fd(),
            len,
        }
    }
}

/// Submit `ops` linked with the kernel's IO_LINK flag: they execute in
/// order, as one unit, with no foreign submission interleaved between
/// them. Returns the total number of bytes the chain transferred.
///
/// Argument validation happens before anything is submitted; a failure to
/// push the tail of a partially submitted chain cancels the linked prefix
/// explicitly.
pub fn chain(ops: &[ChainOp]) -> Result<usize> {
    if ops.is_empty() {
        return Err(Error::InvalidArgument("empty chain"));
    }
    for op in ops {
        if let ChainOp::Splice { len: 0, .. } = op {
            return Err(Error::InvalidArgument("zero-length splice in chain"));
        }
    }

    let links = ops.len() as u32;
    let ctx = runtime::with(|rt| {
        let me = rt.current.expect("chain outside of a fiber");
        rt.ring.store.acquire_chain(me, links)
    });

    let mut submitted = 0u32;
    let mut push_err = None;
    for (i, op) in ops.iter().enumerate() {
        let mut entry = match op {
            ChainOp::Write { fd, buf } => {
                runtime::with(|rt| rt.ring.store.attach(ctx, OpBuf::Data((*buf).clone())));
                let (ptr, len) = buf.raw_parts();
                opcode::Write::new(types::Fd(*fd), ptr, len as u32)
                    .offset(NO_OFFSET)
                    .build()
            }
            ChainOp::Send { fd, buf, flags } => {
                runtime::with(|rt| rt.ring.store.attach(ctx, OpBuf::Data((*buf).clone())));
                let (ptr, len) = buf.raw_parts();
                opcode::Send::new(types::Fd(*fd), ptr, len as u32)
                    .flags(*flags)
                    .build()
            }
            ChainOp::Splice { src, dst, len } => {
                opcode::Splice::new(types::Fd(*src), -1, types::Fd(*dst), -1, *len).build()
            }
        };
        if i + 1 < ops.len() {
            entry = entry.flags(squeue::Flags::IO_LINK);
        }
        let entry = entry.user_data(ctx as u64);
        match push_entry(&entry) {
            Ok(()) => submitted += 1,
            Err(e) => {
                push_err = Some(e);
                break;
            }
        }
    }

    if let Some(e) = push_err {
        runtime::with(|rt| {
            // the links that never reached the ring give their shares back
            for _ in submitted..links {
                rt.ring.store.release(ctx);
            }
            if submitted > 0 {
                rt.ring.submit_cancel(ctx);
            } else {
                // nothing in flight: the fiber share goes too
                rt.ring.store.release(ctx);
            }
        });
        if submitted > 0 {
            // wait for the cancelled prefix to settle so nothing leaks
            let _ = await_op(ctx, false);
        }
        return Err(e);
    }

    let total = await_op(ctx, false)?;
    Ok(total as usize)
}

////////////////////////////////////////////////////////////////////////////////
// Waiting
////////////////////////////////////////////////////////////////////////////////

/// Yield until `io` is ready for the requested interests.
pub fn wait_io(io: &impl AsRawFd, interest: Interest) -> Result<()> {
    if interest.is_empty() {
        return Err(Error::InvalidArgument("empty poll interest"));
    }
    let mut events = 0u32;
    if interest.contains(Interest::READ) {
        events |= libc::POLLIN as u32;
    }
    if interest.contains(Interest::WRITE) {
        events |= libc::POLLOUT as u32;
    }
    let entry = opcode::PollAdd::new(types::Fd(io.as_raw_fd()), events).build();
    let idx = prepare(OpKind::Poll, entry, vec![], None)?;
    await_op(idx, false)?;
    Ok(())
}

/// Park the fiber until the runtime's [`Waker`](crate::ring::Waker) is
/// triggered (typically from another thread or a signal handler).
pub fn wait_event() -> Result<()> {
    runtime::with(|rt| -> Result<()> {
        rt.ring.ensure_event()?;
        let me = rt.current.expect("wait_event outside of a fiber");
        rt.ring.event_waiters.push(me);
        Ok(())
    })?;
    match runtime::suspend() {
        Ok(_) => Ok(()),
        Err(e) => {
            runtime::with(|rt| {
                let me = rt.current.expect("wait_event outside of a fiber");
                rt.ring.event_waiters.retain(|w| *w != me);
            });
            Err(e)
        }
    }
}

/// Yield until the child process `pid` exits, then reap it. Returns the
/// raw wait status.
///
/// Uses `pidfd_open(2)` so the wait goes through the ring like any other
/// readiness event; the final reap cannot block because the child is
/// already a zombie.
pub fn waitpid(pid: libc::pid_t) -> Result<i32> {
    let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) } as RawFd;
    if pidfd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let result = (|| -> Result<i32> {
        let entry = opcode::PollAdd::new(types::Fd(pidfd), libc::POLLIN as u32).build();
        let idx = prepare(OpKind::Poll, entry, vec![], None)?;
        await_op(idx, false)?;
        let mut status: libc::c_int = 0;
        if unsafe { libc::waitpid(pid, &mut status, 0) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(status)
    })();
    unsafe { libc::close(pidfd) };
    result
}

/// Close an owned descriptor through the ring.
pub(crate) fn close_raw(fd: RawFd) -> Result<()> {
    let entry = opcode::Close::new(types::Fd(fd)).build();
    let idx = prepare(OpKind::Close, entry, vec![], None)?;
    await_op(idx, false)?;
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Socket address conversions
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn sockaddr_from_std(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

pub(crate) fn sockaddr_to_std(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sin =
                unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
