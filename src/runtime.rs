//! The per-thread runtime: fiber table, run queue and switching discipline.
//!
//! One runtime serves one OS thread. All state lives in a thread-local
//! cell; entry points borrow it briefly, decide what to do, release the
//! borrow and only then perform the context switch. Holding a borrow
//! across a switch would poison the cell for the fiber being resumed, so
//! every switch site follows the same gather-release-jump shape.
//!
//! Scheduling policy:
//! - runnable fibers resume in FIFO order; a prioritized schedule (used by
//!   cancellation) jumps the queue;
//! - when the queue is empty the backend is polled *blocking*: the OS
//!   thread sleeps in the ring's wait-for-completion until some fiber
//!   becomes runnable;
//! - before every blocking poll the idle tasks run (user hook plus pool
//!   housekeeping), and they never block.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use slab::Slab;

use crate::error::{Error, Result, Token};
use crate::fiber::{self, FiberCell, FiberContext, FiberId, FiberState, JoinState};
use crate::ring::Backend;
use crate::stack::{Stack, DEFAULT_STACK_SIZE};

/// Why a suspended fiber was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Result of the ring operation the fiber was awaiting.
    Op(i32),
    /// A shared-granularity timer tick.
    Tick,
    /// A plain wakeup: `yield_now`, [`Fiber::wakeup`](crate::Fiber::wakeup)
    /// or an internal notification.
    Unit,
}

/// The value delivered at a suspension point: either a wakeup or an error
/// to re-raise (cancellation, deadline expiry).
pub(crate) type Resume = std::result::Result<Wake, Error>;

////////////////////////////////////////////////////////////////////////////////
// Run queue
////////////////////////////////////////////////////////////////////////////////

/// FIFO of runnable fibers with their pending resume values.
///
/// The `scheduled` flag on the fiber record keeps any fiber from appearing
/// twice: the first schedule wins, later ones are dropped until the fiber
/// is popped.
#[derive(Default)]
pub(crate) struct RunQueue {
    queue: VecDeque<(FiberId, Resume)>,
}

impl RunQueue {
    /// Returns `false` when the push was dropped (unknown, dead or already
    /// queued fiber).
    pub fn push(
        &mut self,
        fibers: &mut Slab<FiberCell>,
        id: FiberId,
        resume: Resume,
        prioritize: bool,
    ) -> bool {
        let cell = match fibers.get_mut(id) {
            Some(cell) if cell.state != FiberState::Dead => cell,
            _ => return false,
        };
        if cell.scheduled {
            return false;
        }
        cell.scheduled = true;
        if cell.state == FiberState::Waiting {
            cell.state = FiberState::Runnable;
        }
        if prioritize {
            self.queue.push_front((id, resume));
        } else {
            self.queue.push_back((id, resume));
        }
        true
    }

    pub fn pop(&mut self, fibers: &mut Slab<FiberCell>) -> Option<(FiberId, Resume)> {
        while let Some((id, resume)) = self.queue.pop_front() {
            match fibers.get_mut(id) {
                Some(cell) if cell.state != FiberState::Dead => {
                    cell.scheduled = false;
                    return Some((id, resume));
                }
                // stale entry for a fiber that died while queued
                _ => continue,
            }
        }
        None
    }

    /// Remove an entry by fiber identity.
    pub fn remove(&mut self, fibers: &mut Slab<FiberCell>, id: FiberId) {
        let before = self.queue.len();
        self.queue.retain(|(f, _)| *f != id);
        if self.queue.len() != before {
            if let Some(cell) = fibers.get_mut(id) {
                cell.scheduled = false;
                if cell.state == FiberState::Runnable {
                    cell.state = FiberState::Waiting;
                }
            }
        }
    }

    /// Remove a stale deadline wakeup: the entry for `id` whose value is
    /// the expiry of exactly the deadline scope `token`.
    pub fn remove_token(&mut self, fibers: &mut Slab<FiberCell>, id: FiberId, token: Token) {
        let before = self.queue.len();
        self.queue
            .retain(|(f, r)| !(*f == id && matches!(r, Err(Error::TimedOut(t)) if *t == token)));
        if self.queue.len() != before {
            if let Some(cell) = fibers.get_mut(id) {
                cell.scheduled = false;
                if cell.state == FiberState::Runnable {
                    cell.state = FiberState::Waiting;
                }
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Runtime cell
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Runtime {
    pub fibers: Slab<FiberCell>,
    pub current: Option<FiberId>,
    pub run_queue: RunQueue,
    pub ring: Backend,
    pub stack_pool: Vec<Stack>,
    pub main_ctx: FiberContext,
    pub next_token: u64,
}

impl Runtime {
    fn new() -> Result<Runtime> {
        Ok(Runtime {
            fibers: Slab::new(),
            current: None,
            run_queue: RunQueue::default(),
            ring: Backend::new()?,
            stack_pool: Vec::new(),
            main_ctx: FiberContext::null(),
            next_token: 0,
        })
    }

    /// Schedule `id`; both halves of the borrow live in `self`, which is
    /// what every internal caller has.
    pub fn enqueue(&mut self, id: FiberId, resume: Resume, prioritize: bool) -> bool {
        self.run_queue.push(&mut self.fibers, id, resume, prioritize)
    }

    pub fn fresh_token(&mut self) -> Token {
        self.next_token += 1;
        Token(self.next_token)
    }
}

thread_local! {
    static RUNTIME: RefCell<Option<Runtime>> = RefCell::new(None);
}

/// Borrow the runtime. Panics when called outside [`run`].
pub(crate) fn with<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    RUNTIME.with(|cell| {
        let mut slot = cell.borrow_mut();
        let rt = slot
            .as_mut()
            .expect("no spindle runtime on this thread; wrap the call in spindle::run");
        f(rt)
    })
}

/// Borrow the runtime if there is one; `None` otherwise.
pub(crate) fn try_with<R>(f: impl FnOnce(&mut Runtime) -> R) -> Option<R> {
    RUNTIME.with(|cell| cell.borrow_mut().as_mut().map(f))
}

pub(crate) fn current_id() -> FiberId {
    with(|rt| rt.current.expect("no running fiber"))
}

pub(crate) fn fresh_token() -> Token {
    with(|rt| rt.fresh_token())
}

/// Make `id` runnable with `resume`. Dropped silently when the fiber is
/// dead or already queued (first schedule wins).
pub(crate) fn schedule(id: FiberId, resume: Resume, prioritize: bool) {
    with(|rt| {
        rt.enqueue(id, resume, prioritize);
    });
}

////////////////////////////////////////////////////////////////////////////////
// Switching
////////////////////////////////////////////////////////////////////////////////

enum NextStep {
    Jump(*mut FiberContext, *const FiberContext),
    Stay,
    Poll,
}

fn pick_next(rt: &mut Runtime) -> Option<(FiberId, *const FiberContext)> {
    let Runtime {
        fibers, run_queue, ..
    } = rt;
    let (next, resume) = run_queue.pop(fibers)?;
    let cell = &mut fibers[next];
    cell.resume = Some(resume);
    cell.state = FiberState::Running;
    let load: *const FiberContext = &cell.ctx;
    Some((next, load))
}

/// Switch away from the current fiber. Control comes back once somebody
/// schedules it again; the delivered value is in its resume slot.
fn switch_away() -> Result<()> {
    loop {
        // pump the ring first so yield loops observe completions: flushing
        // is a no-op without deferred entries and draining the CQ is plain
        // ring-buffer reads, no syscall
        with(|rt| {
            let Runtime {
                ring,
                fibers,
                run_queue,
                ..
            } = rt;
            ring.poll(false, fibers, run_queue)
        })?;
        let step = with(|rt| {
            let prev = rt.current.expect("switch outside of a fiber");
            match pick_next(rt) {
                Some((next, _)) if next == prev => NextStep::Stay,
                Some((next, load)) => {
                    rt.current = Some(next);
                    let prev_cell = &mut rt.fibers[prev];
                    if prev_cell.state == FiberState::Running {
                        prev_cell.state = if prev_cell.scheduled {
                            FiberState::Runnable
                        } else {
                            FiberState::Waiting
                        };
                    }
                    let save: *mut FiberContext = &mut prev_cell.ctx;
                    NextStep::Jump(save, load)
                }
                None => NextStep::Poll,
            }
        });
        match step {
            NextStep::Jump(save, load) => {
                unsafe { fiber::switch(save, load) };
                return Ok(());
            }
            NextStep::Stay => return Ok(()),
            NextStep::Poll => poll_backend()?,
        }
    }
}

/// Yield without self-scheduling and return the value the waker delivered.
pub(crate) fn suspend() -> Result<Wake> {
    switch_away()?;
    let resume = with(|rt| {
        let id = rt.current.expect("resumed with no current fiber");
        rt.fibers[id].resume.take()
    });
    resume.unwrap_or(Ok(Wake::Unit))
}

/// One blocking pump of the backend, preceded by the idle tasks.
fn poll_backend() -> Result<()> {
    // user idle hook runs outside the runtime borrow so it may call back
    // into the runtime
    let hook = with(|rt| {
        let Runtime {
            ring, stack_pool, ..
        } = rt;
        ring.idle_tasks(stack_pool)
    });
    if let Some(mut hook) = hook {
        hook();
        with(|rt| rt.ring.restore_idle_hook(hook));
    }
    with(|rt| {
        let Runtime {
            ring,
            fibers,
            run_queue,
            ..
        } = rt;
        ring.poll(true, fibers, run_queue)
    })
}

/// Exit path of every fiber: wait for children, publish death, switch
/// away forever.
pub(crate) fn finish_current() -> ! {
    let id = with(|rt| {
        let id = rt.current.expect("fiber exit with no current fiber");
        rt.fibers[id].completed = true;
        id
    });

    // A fiber does not die before its children; the last child to exit
    // wakes the draining parent. Anything else delivered here (including
    // late cancellations) no longer has a target and is dropped.
    loop {
        let pending = with(|rt| !rt.fibers[id].children.is_empty());
        if !pending {
            break;
        }
        let _ = suspend();
    }

    let is_root = with(|rt| {
        let (join, parent, stack) = {
            let cell = &mut rt.fibers[id];
            cell.state = FiberState::Dead;
            (cell.join, cell.parent, cell.stack.take())
        };
        // The stack goes back to the pool while we still execute on it;
        // nothing can reuse it before the jump below, this thread is busy
        // right here.
        if let Some(stack) = stack {
            rt.stack_pool.push(stack);
        }
        {
            let Runtime {
                fibers, run_queue, ..
            } = rt;
            run_queue.remove(fibers, id);
        }
        if let JoinState::Waiting(joiner) = join {
            rt.fibers[id].join = JoinState::Unused;
            rt.enqueue(joiner, Ok(Wake::Unit), false);
        }
        if let Some(parent) = parent {
            rt.fibers[parent].children.remove(&id);
            if rt.fibers[parent].completed && rt.fibers[parent].children.is_empty() {
                rt.enqueue(parent, Ok(Wake::Unit), false);
            }
        }
        if join == JoinState::Dropped {
            rt.fibers.remove(id);
        }
        parent.is_none()
    });

    let mut graveyard = FiberContext::null();
    if is_root {
        let load = with(|rt| {
            rt.current = None;
            &rt.main_ctx as *const FiberContext
        });
        unsafe { fiber::switch(&mut graveyard, load) };
        unreachable!("dead root fiber resumed");
    }
    loop {
        let target = with(|rt| {
            pick_next(rt).map(|(next, load)| {
                rt.current = Some(next);
                load
            })
        });
        if let Some(load) = target {
            unsafe { fiber::switch(&mut graveyard, load) };
            unreachable!("dead fiber resumed");
        }
        if let Err(e) = poll_backend() {
            // nowhere to propagate from a dying fiber
            log::error!("backend poll failed during fiber exit: {}", e);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Spawning and the entry point
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn spawn_fiber(entry: Box<dyn FnOnce()>, detached: bool) -> FiberId {
    with(|rt| {
        let stack = match rt.stack_pool.pop() {
            Some(stack) => stack,
            None => Stack::new(DEFAULT_STACK_SIZE).expect("failed to allocate fiber stack"),
        };
        let ctx = unsafe { fiber::prepare_stack(stack.top()) };
        let parent = rt.current;
        let id = rt.fibers.insert(FiberCell {
            ctx,
            stack: Some(stack),
            state: FiberState::Runnable,
            scheduled: false,
            completed: false,
            resume: None,
            entry: Some(entry),
            parent,
            children: Default::default(),
            join: if detached {
                JoinState::Dropped
            } else {
                JoinState::Unused
            },
        });
        if let Some(parent) = parent {
            rt.fibers[parent].children.insert(id);
        }
        rt.enqueue(id, Ok(Wake::Unit), false);
        id
    })
}

/// Install a runtime on this thread, run `f` as the root fiber and return
/// its value once every fiber has terminated.
///
/// The ring, the op-context store and all pooled stacks are torn down
/// before this returns. Fails with [`Error::NestedRuntime`] when a runtime
/// is already active on the thread.
pub fn run<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    RUNTIME.with(|cell| {
        if cell.borrow().is_some() {
            return Err(Error::NestedRuntime);
        }
        let rt = Runtime::new()?;
        *cell.borrow_mut() = Some(rt);
        Ok(())
    })?;

    let slot = Rc::new(RefCell::new(None));
    let fiber_slot = slot.clone();
    let entry: Box<dyn FnOnce()> = Box::new(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        *fiber_slot.borrow_mut() = Some(result);
    });
    let root = spawn_fiber(entry, true);

    let (save, load) = with(|rt| {
        let (next, _) = pick_next(rt).expect("root fiber not queued");
        debug_assert_eq!(next, root);
        rt.current = Some(next);
        let save: *mut FiberContext = &mut rt.main_ctx;
        let load: *const FiberContext = &rt.fibers[next].ctx;
        (save, load)
    });
    unsafe { fiber::switch(save, load) };

    // the root exit path only jumps back here after the whole fiber tree
    // is dead
    let rt = RUNTIME
        .with(|cell| cell.borrow_mut().take())
        .expect("runtime vanished");
    drop(rt);

    let result = match slot.borrow_mut().take() {
        Some(Ok(value)) => Ok(value),
        _ => Err(Error::FiberPanicked),
    };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_cell() -> FiberCell {
        FiberCell {
            ctx: FiberContext::null(),
            stack: None,
            state: FiberState::Waiting,
            scheduled: false,
            completed: false,
            resume: None,
            entry: None,
            parent: None,
            children: Default::default(),
            join: JoinState::Unused,
        }
    }

    #[test]
    fn queue_dedupes_by_fiber() {
        let mut fibers = Slab::new();
        let id = fibers.insert(dummy_cell());
        let mut q = RunQueue::default();

        assert!(q.push(&mut fibers, id, Ok(Wake::Unit), false));
        assert!(!q.push(&mut fibers, id, Ok(Wake::Tick), false));
        assert_eq!(q.len(), 1);

        let (popped, resume) = q.pop(&mut fibers).unwrap();
        assert_eq!(popped, id);
        assert!(matches!(resume, Ok(Wake::Unit)));
        assert!(q.pop(&mut fibers).is_none());

        // poppable again after the flag was cleared
        assert!(q.push(&mut fibers, id, Ok(Wake::Unit), false));
    }

    #[test]
    fn prioritized_push_goes_to_the_head() {
        let mut fibers = Slab::new();
        let a = fibers.insert(dummy_cell());
        let b = fibers.insert(dummy_cell());
        let mut q = RunQueue::default();

        q.push(&mut fibers, a, Ok(Wake::Unit), false);
        q.push(&mut fibers, b, Err(Error::Cancelled), true);

        let (first, resume) = q.pop(&mut fibers).unwrap();
        assert_eq!(first, b);
        assert!(matches!(resume, Err(Error::Cancelled)));
    }

    #[test]
    fn remove_token_only_hits_the_matching_deadline() {
        let mut fibers = Slab::new();
        let id = fibers.insert(dummy_cell());
        let mut q = RunQueue::default();

        q.push(&mut fibers, id, Err(Error::TimedOut(Token(7))), false);
        q.remove_token(&mut fibers, id, Token(8));
        assert_eq!(q.len(), 1);
        q.remove_token(&mut fibers, id, Token(7));
        assert_eq!(q.len(), 0);
        assert!(!fibers[id].scheduled);
    }

    #[test]
    fn dead_fibers_never_come_off_the_queue() {
        let mut fibers = Slab::new();
        let id = fibers.insert(dummy_cell());
        let mut q = RunQueue::default();

        q.push(&mut fibers, id, Ok(Wake::Unit), false);
        fibers[id].state = FiberState::Dead;
        assert!(q.pop(&mut fibers).is_none());
    }
}
