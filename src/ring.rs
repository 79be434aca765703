//! The io_uring backend.
//!
//! Owns the submission/completion ring and the op-context store, and turns
//! completions into fiber wake-ups. The backend never switches fibers
//! itself; it only pushes them onto the run queue and lets the scheduler
//! do the transfer.
//!
//! Submission is deferred by default: entries accumulate in the SQ and a
//! counter tracks how many have not been handed to the kernel yet. The
//! batch is flushed when the counter reaches the ring depth, when an
//! async-cancel has to reach the kernel promptly, and at the top of every
//! poll. The only place the OS thread blocks is `submit_and_wait` inside
//! a blocking poll.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring};
use slab::Slab;

use crate::buf::Buffer;
use crate::clock;
use crate::error::{Error, Result};
use crate::fiber::{FiberCell, FiberId};
use crate::op::{OpBuf, OpKind, OpStore, MULTISHOT};
use crate::runtime::{self, RunQueue, Wake};
use crate::stack::Stack;

/// Initial ring depth; also the deferred-submission flush threshold.
const RING_DEPTH: u32 = 1024;
/// Depth is halved on ENOMEM, but never below this.
const MIN_RING_DEPTH: u32 = 64;
/// Pooled stacks kept across an idle housekeeping pass.
const IDLE_STACK_KEEP: usize = 4;

/// Backlog of a listener with an active (or winding-down) multishot
/// accept: fds the kernel accepted that no fiber has picked up yet.
pub(crate) struct Backlog {
    pub ready: VecDeque<RawFd>,
    pub waiter: Option<FiberId>,
    /// Context index of the in-flight multishot entry; `None` once the
    /// kernel retired it (final completion seen).
    pub ctx: Option<usize>,
    /// Cleared when the accepting scope unwinds; queued fds are then
    /// closed instead of leaked.
    pub live: bool,
    /// Deferred accept failure (negative errno), delivered to the next
    /// waiter. 0 = clean.
    pub error: i32,
}

pub(crate) struct Backend {
    ring: IoUring,
    /// Ring depth; deferred submissions flush when they reach it.
    prepared_limit: u32,
    /// SQEs pushed but not yet handed to the kernel.
    pending_sqes: u32,
    pub store: OpStore,
    pub backlogs: HashMap<RawFd, Backlog>,
    /// Fibers parked in `wait_event`.
    pub event_waiters: Vec<FiberId>,
    event_fd: Option<RawFd>,
    /// Context of the standing eventfd read, when armed.
    event_ctx: Option<usize>,
    idle_period: Option<Duration>,
    last_idle: f64,
    idle_hook: Option<Box<dyn FnMut()>>,
}

impl Backend {
    pub fn new() -> Result<Backend> {
        let (ring, depth) = create_ring(RING_DEPTH)?;
        log::debug!("ring ready, depth {}", depth);
        Ok(Backend {
            ring,
            prepared_limit: depth,
            pending_sqes: 0,
            store: OpStore::default(),
            backlogs: HashMap::new(),
            event_waiters: Vec::new(),
            event_fd: None,
            event_ctx: None,
            idle_period: None,
            last_idle: clock::monotonic(),
            idle_hook: None,
        })
    }

    ////////////////////////////////////////////////////////////////////////
    // Submission
    ////////////////////////////////////////////////////////////////////////

    /// Push one entry, flushing once if the SQ is full. `Ok(false)` means
    /// the queue is still full after the flush and the caller should
    /// snooze and retry.
    pub fn try_push(&mut self, entry: &squeue::Entry) -> Result<bool> {
        for attempt in 0..2 {
            let pushed = {
                let mut sq = self.ring.submission();
                unsafe { sq.push(entry) }.is_ok()
            };
            if pushed {
                self.pending_sqes += 1;
                if self.pending_sqes >= self.prepared_limit {
                    self.flush()?;
                }
                return Ok(true);
            }
            if attempt == 0 {
                self.flush()?;
            }
        }
        Ok(false)
    }

    /// Hand every deferred entry to the kernel.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending_sqes == 0 {
            return Ok(());
        }
        loop {
            match self.ring.submit() {
                Ok(_) => {
                    self.pending_sqes = 0;
                    return Ok(());
                }
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                // completion queue is full; the next drain makes room and
                // the entries stay queued until then
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Ask the kernel to cancel the in-flight operation behind `target`.
    /// Fire-and-forget: the cancellation gets its own ownerless context
    /// and the original op settles through the normal completion path.
    pub fn submit_cancel(&mut self, target: usize) {
        let idx = self.store.acquire_bare(OpKind::Cancel);
        let entry = opcode::AsyncCancel::new(target as u64)
            .build()
            .user_data(idx as u64);
        match self.try_push(&entry) {
            Ok(true) => {
                // the target may be parked in the kernel for a long time;
                // do not sit on the cancel
                if let Err(e) = self.flush() {
                    log::error!("failed to flush async-cancel: {}", e);
                }
            }
            Ok(false) => {
                log::error!("submission queue saturated, async-cancel dropped");
                self.store.release(idx);
            }
            Err(e) => {
                log::error!("failed to push async-cancel: {}", e);
                self.store.release(idx);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Reaping
    ////////////////////////////////////////////////////////////////////////

    /// The scheduler's idle pump. With `blocking` the OS thread sleeps in
    /// the ring until at least one completion (or a signal) arrives.
    pub fn poll(
        &mut self,
        blocking: bool,
        fibers: &mut Slab<FiberCell>,
        queue: &mut RunQueue,
    ) -> Result<()> {
        self.flush()?;
        let reaped = self.drain(fibers, queue);
        if reaped > 0 || !blocking {
            return Ok(());
        }
        match self.ring.submit_and_wait(1) {
            Ok(_) => self.pending_sqes = 0,
            // interrupted: let the scheduler loop re-check the run queue
            // and come back if it is still empty
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {}
            Err(e) => return Err(e.into()),
        }
        self.drain(fibers, queue);
        Ok(())
    }

    /// Process all ready completions, in ring order.
    fn drain(&mut self, fibers: &mut Slab<FiberCell>, queue: &mut RunQueue) -> usize {
        let ready: Vec<(u64, i32, u32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result(), cqe.flags()))
            .collect();
        for &(ud, res, flags) in &ready {
            self.dispatch(ud, res, flags, fibers, queue);
        }
        ready.len()
    }

    fn dispatch(
        &mut self,
        ud: u64,
        res: i32,
        flags: u32,
        fibers: &mut Slab<FiberCell>,
        queue: &mut RunQueue,
    ) {
        let idx = ud as usize;

        if self.event_ctx == Some(idx) {
            self.event_completed(idx, res, fibers, queue);
            return;
        }
        if !self.store.contains(idx) {
            log::warn!("completion for unknown context {} (res {})", idx, res);
            return;
        }

        let (kind, rc, token) = {
            let ctx = self.store.get_mut(idx);
            (ctx.kind, ctx.rc, ctx.token)
        };

        if rc == MULTISHOT {
            self.multishot_completed(idx, res, flags, fibers, queue);
            return;
        }

        match kind {
            // a deadline entry: expiry wakes the owner with the sentinel,
            // the cancellation echo (the guarded block won) is silent
            OpKind::Timeout if token.is_some() => {
                let fiber = self.store.get_mut(idx).fiber;
                if rc == 2 && res != -libc::ECANCELED {
                    if let Some(fiber) = fiber {
                        let t = token.unwrap();
                        queue.push(fibers, fiber, Err(Error::TimedOut(t)), false);
                    }
                }
                self.store.release(idx);
            }
            OpKind::Chain => {
                {
                    let ctx = self.store.get_mut(idx);
                    if res >= 0 {
                        ctx.result = ctx.result.saturating_add(res);
                    } else if res != -libc::ECANCELED && ctx.chain_err == 0 {
                        ctx.chain_err = res;
                    }
                }
                let freed = self.store.release(idx);
                if !freed {
                    let ctx = self.store.get_mut(idx);
                    // the last linked completion reports the whole chain
                    if ctx.rc == 1 {
                        if let Some(fiber) = ctx.fiber {
                            let value = if ctx.chain_err != 0 {
                                ctx.chain_err
                            } else {
                                ctx.result
                            };
                            queue.push(fibers, fiber, Ok(Wake::Op(value)), false);
                        }
                    }
                }
            }
            _ => {
                // normal op: deliver to the owner unless it was already
                // torn down (rc 1: the fiber was cancelled and has moved
                // on; the context only waited for this echo)
                let fiber = {
                    let ctx = self.store.get_mut(idx);
                    ctx.result = res;
                    ctx.fiber
                };
                if rc == 2 {
                    if let Some(fiber) = fiber {
                        queue.push(fibers, fiber, Ok(Wake::Op(res)), false);
                    }
                }
                self.store.release(idx);
            }
        }
    }

    fn multishot_completed(
        &mut self,
        idx: usize,
        res: i32,
        flags: u32,
        fibers: &mut Slab<FiberCell>,
        queue: &mut RunQueue,
    ) {
        let more = cqueue::more(flags);
        let key = self
            .backlogs
            .iter()
            .find(|(_, b)| b.ctx == Some(idx))
            .map(|(k, _)| *k);

        let key = match key {
            Some(key) => key,
            None => {
                // scope long gone; never leak the fd
                if res >= 0 {
                    unsafe { libc::close(res) };
                }
                if !more {
                    self.store.release_multishot(idx);
                }
                return;
            }
        };

        let mut drop_backlog = false;
        {
            let backlog = self.backlogs.get_mut(&key).unwrap();
            if res >= 0 {
                if backlog.live {
                    backlog.ready.push_back(res);
                } else {
                    unsafe { libc::close(res) };
                }
            } else if res != -libc::ECANCELED && backlog.live && backlog.error == 0 {
                backlog.error = res;
            }
            if !more {
                backlog.ctx = None;
            }
            if let Some(waiter) = backlog.waiter.take() {
                queue.push(fibers, waiter, Ok(Wake::Unit), false);
            }
            if !more && !backlog.live {
                for fd in backlog.ready.drain(..) {
                    unsafe { libc::close(fd) };
                }
                drop_backlog = true;
            }
        }
        if !more {
            self.store.release_multishot(idx);
        }
        if drop_backlog {
            self.backlogs.remove(&key);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Eventfd wakeup
    ////////////////////////////////////////////////////////////////////////

    /// Cross-thread wakeup handle. Creating it arms the backend eventfd.
    pub fn waker(&mut self) -> Result<Waker> {
        let fd = self.ensure_event()?;
        Ok(Waker { fd })
    }

    pub fn ensure_event(&mut self) -> Result<RawFd> {
        if let Some(fd) = self.event_fd {
            return Ok(fd);
        }
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        self.event_fd = Some(fd);
        self.arm_event()?;
        Ok(fd)
    }

    /// Keep one read pending on the eventfd; its completion is what turns
    /// an external `Waker::wake` into a returned `submit_and_wait`.
    fn arm_event(&mut self) -> Result<()> {
        let fd = self.event_fd.expect("arming event without an eventfd");
        let buf = Buffer::with_capacity(8);
        let ptr = buf.raw_at(0);
        let idx = self.store.acquire_bare(OpKind::Read);
        self.store.attach(idx, OpBuf::Data(buf));
        let entry = opcode::Read::new(types::Fd(fd), ptr, 8)
            .build()
            .user_data(idx as u64);
        if !self.try_push(&entry)? {
            self.store.release(idx);
            return Err(Error::IO(io::Error::new(
                io::ErrorKind::Other,
                "submission queue saturated while arming event fd",
            )));
        }
        self.event_ctx = Some(idx);
        Ok(())
    }

    fn event_completed(
        &mut self,
        idx: usize,
        res: i32,
        fibers: &mut Slab<FiberCell>,
        queue: &mut RunQueue,
    ) {
        self.event_ctx = None;
        self.store.release(idx);
        if res < 0 && res != -libc::ECANCELED {
            log::warn!("event fd read failed: {}", res);
        }
        for waiter in std::mem::take(&mut self.event_waiters) {
            queue.push(fibers, waiter, Ok(Wake::Unit), false);
        }
        if let Err(e) = self.arm_event() {
            log::error!("failed to re-arm event fd: {}", e);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Idle tasks
    ////////////////////////////////////////////////////////////////////////

    /// Runs before every blocking wait. Periodic housekeeping happens
    /// here; the returned user hook is invoked by the scheduler outside
    /// the runtime borrow. Nothing in here may block.
    pub fn idle_tasks(&mut self, stack_pool: &mut Vec<Stack>) -> Option<Box<dyn FnMut()>> {
        if let Some(period) = self.idle_period {
            let now = clock::monotonic();
            if now - self.last_idle >= period.as_secs_f64() {
                self.last_idle = now;
                if stack_pool.len() > IDLE_STACK_KEEP {
                    log::trace!(
                        "idle housekeeping: releasing {} pooled stacks",
                        stack_pool.len() - IDLE_STACK_KEEP
                    );
                    stack_pool.truncate(IDLE_STACK_KEEP);
                }
            }
        }
        self.idle_hook.take()
    }

    pub fn restore_idle_hook(&mut self, hook: Box<dyn FnMut()>) {
        if self.idle_hook.is_none() {
            self.idle_hook = Some(hook);
        }
    }

    pub fn set_idle_period(&mut self, period: Option<Duration>) {
        self.idle_period = period;
        self.last_idle = clock::monotonic();
    }

    pub fn set_idle_hook(&mut self, hook: Option<Box<dyn FnMut()>>) {
        self.idle_hook = hook;
    }

    /// Contexts tied to user-visible operations still alive.
    pub fn inflight(&self) -> usize {
        self.store.outstanding() - self.event_ctx.is_some() as usize
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        // the ring itself is torn down by the IoUring drop
        if let Some(fd) = self.event_fd.take() {
            unsafe { libc::close(fd) };
        }
    }
}

fn create_ring(mut depth: u32) -> Result<(IoUring, u32)> {
    loop {
        let built = IoUring::builder()
            .setup_submit_all()
            .setup_coop_taskrun()
            .build(depth)
            .or_else(|e| {
                // pre-5.18/5.19 kernels reject the flags
                log::debug!("ring setup flags rejected ({}), retrying flagless", e);
                IoUring::new(depth)
            });
        match built {
            Ok(ring) => return Ok((ring, depth)),
            Err(e) if e.raw_os_error() == Some(libc::ENOMEM) && depth > MIN_RING_DEPTH => {
                depth /= 2;
                log::warn!("ENOMEM creating ring, halving depth to {}", depth);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Wakes a runtime parked in its blocking wait. The only crate object
/// that may be used from another thread.
#[derive(Clone)]
pub struct Waker {
    fd: RawFd,
}

// the eventfd write below is atomic and signal-safe
unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    /// Wake the runtime: the parked `submit_and_wait` returns immediately
    /// and any fiber in [`wait_event`](crate::io::wait_event) becomes
    /// runnable.
    pub fn wake(&self) {
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            log::warn!(
                "waker write failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// A handle that wakes this runtime from another thread (or a signal
/// handler).
pub fn waker() -> Result<Waker> {
    runtime::with(|rt| rt.ring.waker())
}

/// Configure the idle housekeeping period (`None` disables it).
pub fn set_idle_period(period: Option<Duration>) {
    runtime::with(|rt| rt.ring.set_idle_period(period));
}

/// Install a callback run each time the runtime is about to block waiting
/// for completions. It must not block.
pub fn set_idle_hook(hook: impl FnMut() + 'static) {
    runtime::with(|rt| rt.ring.set_idle_hook(Some(Box::new(hook))));
}

/// Number of operation contexts currently alive. Returns to zero when all
/// submitted operations have settled; exposed for leak diagnostics.
pub fn inflight_ops() -> usize {
    runtime::with(|rt| rt.ring.inflight())
}
