//! Cooperative multitasking fibers.
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! it owns a private stack, runs until it explicitly yields (directly via
//! [`yield_now`] / [`suspend`], or inside any awaiting I/O or timer call),
//! and is resumed by the scheduler with a value describing why it woke up.
//!
//! A fiber has four states: **runnable** (queued), **running**, **waiting**
//! (suspended, not queued) and **dead**. Cancellation is advisory and
//! value-shaped: [`Fiber::cancel`] schedules the target with an
//! error-carrying resume value, which surfaces as [`Error::Cancelled`] from
//! whatever suspension point the fiber is parked in. A fiber that never
//! suspends never observes cancellation.
//!
//! This module owns the machine-level pieces (context-switch assembly,
//! trampolines, fiber records) and the user-facing handles; the scheduling
//! policy lives in [`runtime`](crate::runtime).

use std::arch::global_asm;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::thread;

use crate::error::{Error, Result};
use crate::runtime::{self, Resume, Wake};
use crate::stack::Stack;

////////////////////////////////////////////////////////////////////////////////
// Context switching
////////////////////////////////////////////////////////////////////////////////

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fiber context switching is implemented for x86_64 and aarch64 only");

// The switch saves the callee-saved register set on the outgoing stack,
// stores the stack pointer into `save`, loads the one from `load` and
// returns into the incoming fiber. Caller-saved registers are left to the
// compiler: `spindle_fiber_switch` is an opaque extern call, so everything
// else is already spilled at the call site.

#[cfg(target_arch = "x86_64")]
global_asm!(
    r#"
    .text
    .globl spindle_fiber_switch
    .type spindle_fiber_switch, @function
spindle_fiber_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, [rsi]
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
    .size spindle_fiber_switch, . - spindle_fiber_switch
"#
);

#[cfg(target_arch = "aarch64")]
global_asm!(
    r#"
    .text
    .globl spindle_fiber_switch
    .type spindle_fiber_switch, @function
spindle_fiber_switch:
    sub sp, sp, #160
    stp x19, x20, [sp, #0]
    stp x21, x22, [sp, #16]
    stp x23, x24, [sp, #32]
    stp x25, x26, [sp, #48]
    stp x27, x28, [sp, #64]
    stp x29, x30, [sp, #80]
    stp d8, d9, [sp, #96]
    stp d10, d11, [sp, #112]
    stp d12, d13, [sp, #128]
    stp d14, d15, [sp, #144]
    mov x9, sp
    str x9, [x0]
    ldr x9, [x1]
    mov sp, x9
    ldp x19, x20, [sp, #0]
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    ldp d8, d9, [sp, #96]
    ldp d10, d11, [sp, #112]
    ldp d12, d13, [sp, #128]
    ldp d14, d15, [sp, #144]
    add sp, sp, #160
    ret
    .size spindle_fiber_switch, . - spindle_fiber_switch
"#
);

extern "C" {
    fn spindle_fiber_switch(save: *mut FiberContext, load: *const FiberContext);
}

/// Saved execution context of a suspended fiber: just the stack pointer,
/// everything else lives on the stack itself.
#[repr(C)]
pub(crate) struct FiberContext {
    sp: *mut u8,
}

impl FiberContext {
    #[inline]
    pub(crate) fn null() -> Self {
        FiberContext {
            sp: std::ptr::null_mut(),
        }
    }
}

/// Transfer control from the context behind `save` to the one behind
/// `load`.
///
/// # Safety
/// `save` must be the context record of the currently running fiber (or a
/// throwaway record when the current stack is being abandoned) and `load`
/// must hold a stack pointer previously produced by this function or by
/// [`prepare_stack`]. No runtime borrow may be held across the call.
#[inline]
pub(crate) unsafe fn switch(save: *mut FiberContext, load: *const FiberContext) {
    spindle_fiber_switch(save, load);
}

/// Lay out a fresh stack so that the first switch into it enters
/// [`fiber_trampoline`] with the alignment the ABI demands.
pub(crate) unsafe fn prepare_stack(top: *mut u8) -> FiberContext {
    #[cfg(target_arch = "x86_64")]
    {
        let top = top as *mut u64;
        // [top-1] padding, [top-2] return address popped by `ret`,
        // [top-8..top-2] the six callee-saved slots.
        top.sub(1).write(0);
        top.sub(2).write(fiber_trampoline as usize as u64);
        for i in 3..=8 {
            top.sub(i).write(0);
        }
        FiberContext {
            sp: top.sub(8) as *mut u8,
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        let top = top as *mut u64;
        // one 160-byte register frame; the x30 slot ([sp, #88]) is the
        // link register the final `ret` jumps through.
        for i in 1..=20 {
            top.sub(i).write(0);
        }
        top.sub(9).write(fiber_trampoline as usize as u64);
        FiberContext {
            sp: top.sub(20) as *mut u8,
        }
    }
}

/// First frame of every fiber: run the entry closure, then hand control to
/// the exit path, which never returns here.
extern "C" fn fiber_trampoline() -> ! {
    let entry = runtime::with(|rt| {
        let id = rt.current.expect("trampoline entered with no current fiber");
        rt.fibers[id].entry.take()
    });
    if let Some(f) = entry {
        // unwinding must never cross the bottom of a fiber stack
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            log::error!("fiber panicked: {:?}", payload);
        }
    }
    runtime::finish_current()
}

////////////////////////////////////////////////////////////////////////////////
// Fiber records
////////////////////////////////////////////////////////////////////////////////

pub(crate) type FiberId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberState {
    Runnable,
    Running,
    Waiting,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinState {
    /// Nobody is interested yet.
    Unused,
    /// This fiber is waiting for the death of the owner of this record.
    Waiting(FiberId),
    /// The handle is gone; the record is removed as soon as the fiber dies.
    Dropped,
}

pub(crate) struct FiberCell {
    pub ctx: FiberContext,
    pub stack: Option<Stack>,
    pub state: FiberState,
    /// In the run queue right now. Guards against double-queueing.
    pub scheduled: bool,
    /// Entry closure has returned; the fiber may still be draining children.
    pub completed: bool,
    pub resume: Option<Resume>,
    pub entry: Option<Box<dyn FnOnce()>>,
    pub parent: Option<FiberId>,
    pub children: BTreeSet<FiberId>,
    pub join: JoinState,
}

////////////////////////////////////////////////////////////////////////////////
// Public surface
////////////////////////////////////////////////////////////////////////////////

/// Identity handle of a live fiber, used to wake or cancel it from another
/// fiber.
///
/// The identity is only meaningful while the fiber is alive; operations on
/// a dead fiber's handle are silent no-ops.
#[derive(Clone)]
pub struct Fiber {
    id: FiberId,
    _not_send: PhantomData<Rc<()>>,
}

impl Fiber {
    /// Handle of the currently running fiber.
    pub fn current() -> Fiber {
        Fiber {
            id: runtime::current_id(),
            _not_send: PhantomData,
        }
    }

    pub fn is_alive(&self) -> bool {
        runtime::with(|rt| {
            rt.fibers
                .get(self.id)
                .map(|c| c.state != FiberState::Dead)
                .unwrap_or(false)
        })
    }

    /// Make the fiber runnable (FIFO order). A no-op if it is already
    /// queued or dead.
    pub fn wakeup(&self) {
        runtime::schedule(self.id, Ok(Wake::Unit), false);
    }

    /// Deliver [`Error::Cancelled`] at the fiber's current (or next)
    /// suspension point. The wakeup jumps the queue so cancellation is not
    /// delayed behind ordinary work.
    pub fn cancel(&self) {
        runtime::schedule(self.id, Err(Error::Cancelled), true);
    }

    /// Remove the fiber from the run queue if it is there.
    pub fn unschedule(&self) {
        runtime::with(|rt| {
            let crate::runtime::Runtime {
                fibers, run_queue, ..
            } = rt;
            run_queue.remove(fibers, self.id);
        })
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Fiber({})", self.id)
    }
}

/// Owned handle for joining or cancelling a spawned fiber.
pub struct JoinHandle<T> {
    id: FiberId,
    slot: Rc<RefCell<Option<thread::Result<T>>>>,
    consumed: bool,
    _not_send: PhantomData<Rc<()>>,
}

impl<T> JoinHandle<T> {
    /// Identity handle of the spawned fiber.
    pub fn fiber(&self) -> Fiber {
        Fiber {
            id: self.id,
            _not_send: PhantomData,
        }
    }

    /// See [`Fiber::cancel`].
    pub fn cancel(&self) {
        self.fiber().cancel()
    }

    /// Yield until the fiber is dead, then take its result.
    ///
    /// Returns [`Error::FiberPanicked`] if the fiber's closure panicked,
    /// and [`Error::Cancelled`] if the *joining* fiber was cancelled while
    /// waiting (the target keeps running in that case).
    pub fn join(mut self) -> Result<T> {
        loop {
            let dead = runtime::with(|rt| {
                rt.fibers
                    .get(self.id)
                    .map(|c| c.state == FiberState::Dead)
                    .unwrap_or(true)
            });
            if dead {
                break;
            }
            runtime::with(|rt| {
                let me = rt.current.expect("join outside of a fiber");
                rt.fibers[self.id].join = JoinState::Waiting(me);
            });
            match runtime::suspend() {
                Ok(_) => continue,
                Err(e) => {
                    runtime::with(|rt| {
                        if let Some(cell) = rt.fibers.get_mut(self.id) {
                            cell.join = JoinState::Unused;
                        }
                    });
                    return Err(e);
                }
            }
        }
        self.consumed = true;
        runtime::with(|rt| {
            if rt.fibers.contains(self.id) {
                rt.fibers.remove(self.id);
            }
        });
        match self.slot.borrow_mut().take() {
            Some(Ok(value)) => Ok(value),
            _ => Err(Error::FiberPanicked),
        }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        // The handle may outlive the runtime (moved out of `run`); nothing
        // to detach then.
        let _ = runtime::try_with(|rt| {
            let state = rt.fibers.get(self.id).map(|c| c.state);
            match state {
                Some(FiberState::Dead) => {
                    rt.fibers.remove(self.id);
                }
                Some(_) => rt.fibers[self.id].join = JoinState::Dropped,
                None => {}
            }
        });
    }
}

/// Spawn a fiber running `f`, returning a handle for joining it.
///
/// The new fiber is queued behind currently runnable fibers and starts the
/// next time the scheduler reaches it. The calling fiber becomes its
/// parent and will not finish before the child does.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let slot = Rc::new(RefCell::new(None));
    let fiber_slot = slot.clone();
    let entry: Box<dyn FnOnce()> = Box::new(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        *fiber_slot.borrow_mut() = Some(result);
    });
    let id = runtime::spawn_fiber(entry, false);
    JoinHandle {
        id,
        slot,
        consumed: false,
        _not_send: PhantomData,
    }
}

/// Spawn a fiber nobody will join; used for runtime-internal helpers.
pub(crate) fn spawn_detached(f: impl FnOnce() + 'static) -> FiberId {
    runtime::spawn_fiber(Box::new(f), true)
}

/// Reschedule the current fiber to the back of the run queue and yield
/// ("snooze"): every other currently runnable fiber gets a turn first.
pub fn yield_now() -> Result<()> {
    runtime::with(|rt| {
        let me = rt.current.expect("yield_now outside of a fiber");
        rt.enqueue(me, Ok(Wake::Unit), false);
    });
    runtime::suspend().map(|_| ())
}

/// Yield without self-scheduling: the fiber sleeps until some other actor
/// wakes it, and resumes with whatever value that actor delivered.
pub fn suspend() -> Result<Wake> {
    runtime::suspend()
}
