//! Sleeps, deadlines and the shared-granularity timer.
//!
//! Two complementary mechanisms live here:
//!
//! - **Ring-based timing**: [`sleep`], [`timer_loop`] and the deadline
//!   scopes [`timeout`] / [`timeout_or`] each submit a ring timeout entry.
//!   A deadline that fires wakes its fiber with a sentinel error carrying
//!   the scope's [`Token`]; the scope that armed it catches its own token
//!   and lets foreign ones propagate, so nested deadlines behave: the
//!   innermost expired timer decides.
//!
//! - **The shared-granularity [`Timer`]**: one ticker fiber multiplexes
//!   any number of sleepers and deadlines onto a single periodic ring
//!   timeout of `resolution`. Cheap when many fibers keep coarse
//!   deadlines; each tick scans a deadline map instead of arming one
//!   kernel timer per waiter.
//!
//! Every record and every deadline entry is removed on all exit paths of
//! the scope that created it, success and failure alike.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::rc::Rc;
use std::time::Duration;

use io_uring::{opcode, types};

use crate::clock;
use crate::error::{Error, Result, Token};
use crate::fiber::{self, FiberId, JoinHandle};
use crate::io::{await_op, prepare};
use crate::op::{OpBuf, OpKind};
use crate::runtime::{self, Runtime, Wake};

fn timespec(dur: Duration) -> types::Timespec {
    types::Timespec::new()
        .sec(dur.as_secs())
        .nsec(dur.subsec_nanos())
}

////////////////////////////////////////////////////////////////////////////////
// Ring-based timing
////////////////////////////////////////////////////////////////////////////////

/// Yield for at least `dur`. `sleep(0)` yields exactly once and resumes
/// behind the currently runnable fibers.
pub fn sleep(dur: Duration) -> Result<()> {
    if dur.is_zero() {
        return fiber::yield_now();
    }
    let ts = Box::new(timespec(dur));
    let ts_ptr: *const types::Timespec = &*ts;
    let entry = opcode::Timeout::new(ts_ptr).build();
    let idx = prepare(OpKind::Timeout, entry, vec![OpBuf::Ts(ts)], None)?;
    match await_op(idx, false) {
        // ETIME is the timer firing, not a failure
        Err(Error::IO(ref e)) if e.raw_os_error() == Some(libc::ETIME) => Ok(()),
        Ok(_) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Invoke `f` every `interval`, drift-corrected: the next deadline is
/// advanced by whole intervals, so a slow iteration collapses missed
/// periods instead of piling them up. Exits only through an error.
pub fn timer_loop(interval: Duration, mut f: impl FnMut() -> Result<()>) -> Result<Infallible> {
    if interval.is_zero() {
        return Err(Error::InvalidArgument("zero timer interval"));
    }
    let step = interval.as_secs_f64();
    let mut next = clock::monotonic() + step;
    loop {
        let now = clock::monotonic();
        if next > now {
            sleep(Duration::from_secs_f64(next - now))?;
        }
        f()?;
        let now = clock::monotonic();
        while next <= now {
            next += step;
        }
    }
}

/// Arm a one-shot ring deadline around `f`; returns the scope token and
/// the raw outcome. The ensure-path drops the fiber's share of the
/// deadline entry, chases a still-armed timer with an async-cancel, and
/// scrubs a stale expiry that may already sit in the run queue.
fn with_deadline<T>(dur: Duration, f: impl FnOnce() -> Result<T>) -> (Token, Result<T>) {
    let token = runtime::fresh_token();
    let ts = Box::new(timespec(dur));
    let ts_ptr: *const types::Timespec = &*ts;
    let entry = opcode::Timeout::new(ts_ptr).build();
    let idx = match prepare(OpKind::Timeout, entry, vec![OpBuf::Ts(ts)], Some(token)) {
        Ok(idx) => idx,
        Err(e) => return (token, Err(e)),
    };

    let result = f();

    runtime::with(|rt| {
        let me = rt.current.expect("deadline scope outside of a fiber");
        rt.ring.store.get_mut(idx).fiber = None;
        let freed = rt.ring.store.release(idx);
        if !freed {
            rt.ring.submit_cancel(idx);
        }
        let Runtime {
            fibers, run_queue, ..
        } = rt;
        run_queue.remove_token(fibers, me, token);
    });
    (token, result)
}

/// Run `f` under a deadline. When the deadline fires first, `f` is
/// interrupted at its current suspension point and the scope returns
/// [`Error::TimedOut`]. Errors unrelated to this scope's deadline
/// propagate unchanged, including an inner scope's expiry.
pub fn timeout<T>(dur: Duration, f: impl FnOnce() -> Result<T>) -> Result<T> {
    with_deadline(dur, f).1
}

/// Like [`timeout`], but expiry is converted into `Ok(default)` instead
/// of an error ("move on").
pub fn timeout_or<T>(dur: Duration, default: T, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let (token, result) = with_deadline(dur, f);
    match result {
        Err(Error::TimedOut(t)) if t == token => Ok(default),
        other => other,
    }
}

////////////////////////////////////////////////////////////////////////////////
// Shared-granularity timer
////////////////////////////////////////////////////////////////////////////////

struct TimeoutRecord {
    /// Monotonic deadline, seconds.
    deadline: f64,
    /// Seconds; re-arm step for recurring records and for `reset`.
    interval: f64,
    recurring: bool,
    /// `None` wakes the fiber with a tick; `Some` delivers the deadline
    /// sentinel.
    token: Option<Token>,
}

struct TimerInner {
    resolution: Duration,
    /// Every fiber currently waiting on this timer. One record per fiber:
    /// a new wait replaces the old record.
    records: BTreeMap<FiberId, TimeoutRecord>,
    ticker: Option<FiberId>,
}

/// A shared-granularity timer: many sleepers and deadlines multiplexed
/// onto one ticker fiber with period `resolution`.
///
/// Deadlines are only as precise as the resolution; that is the deal.
/// Clones share the ticker and the deadline map.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<RefCell<TimerInner>>,
}

impl Timer {
    pub fn new(resolution: Duration) -> Timer {
        assert!(!resolution.is_zero(), "timer resolution must be non-zero");
        Timer {
            inner: Rc::new(RefCell::new(TimerInner {
                resolution,
                records: BTreeMap::new(),
                ticker: None,
            })),
        }
    }

    fn arm(&self, fiber: FiberId, record: TimeoutRecord) {
        self.inner.borrow_mut().records.insert(fiber, record);
        self.ensure_ticker();
    }

    fn ensure_ticker(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.ticker.is_some() {
            return;
        }
        let shared = self.inner.clone();
        let resolution = inner.resolution;
        inner.ticker = Some(fiber::spawn_detached(move || {
            ticker_main(shared, resolution)
        }));
    }

    /// Yield for at least `dur`, at tick granularity.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        let me = runtime::current_id();
        self.arm(
            me,
            TimeoutRecord {
                deadline: clock::monotonic() + dur.as_secs_f64(),
                interval: dur.as_secs_f64(),
                recurring: false,
                token: None,
            },
        );
        let _guard = RecordGuard {
            inner: &self.inner,
            fiber: me,
        };
        loop {
            match runtime::suspend()? {
                Wake::Tick => return Ok(()),
                _ => continue,
            }
        }
    }

    /// Spawn a fiber that sleeps for `dur` and then runs `f`. Cancelling
    /// the fiber during the sleep skips `f`.
    pub fn after<T, F>(&self, dur: Duration, f: F) -> JoinHandle<Result<T>>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let timer = self.clone();
        fiber::spawn(move || -> Result<T> {
            timer.sleep(dur)?;
            Ok(f())
        })
    }

    /// Invoke `f` on every tick of `interval`. Missed ticks collapse: the
    /// deadline advances by whole intervals, so `f` never runs twice to
    /// catch up. Exits only through an error (cancellation, a surrounding
    /// deadline).
    pub fn every(&self, interval: Duration, mut f: impl FnMut()) -> Result<Infallible> {
        if interval.is_zero() {
            return Err(Error::InvalidArgument("zero timer interval"));
        }
        let me = runtime::current_id();
        self.arm(
            me,
            TimeoutRecord {
                deadline: clock::monotonic() + interval.as_secs_f64(),
                interval: interval.as_secs_f64(),
                recurring: true,
                token: None,
            },
        );
        let _guard = RecordGuard {
            inner: &self.inner,
            fiber: me,
        };
        loop {
            match runtime::suspend()? {
                Wake::Tick => f(),
                _ => continue,
            }
        }
    }

    /// Run `f`; if it has not finished within `dur` it is interrupted and
    /// the scope returns [`Error::TimedOut`]. [`reset`](Timer::reset)
    /// inside the scope pushes the deadline out by another `dur`.
    pub fn cancel_after<T>(&self, dur: Duration, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.deadline_scope(dur, f).1
    }

    /// Like [`cancel_after`](Timer::cancel_after), but expiry becomes
    /// `Ok(default)`.
    pub fn move_on_after<T>(
        &self,
        dur: Duration,
        default: T,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let (token, result) = self.deadline_scope(dur, f);
        match result {
            Err(Error::TimedOut(t)) if t == token => Ok(default),
            other => other,
        }
    }

    fn deadline_scope<T>(
        &self,
        dur: Duration,
        f: impl FnOnce() -> Result<T>,
    ) -> (Token, Result<T>) {
        let me = runtime::current_id();
        let token = runtime::fresh_token();
        self.arm(
            me,
            TimeoutRecord {
                deadline: clock::monotonic() + dur.as_secs_f64(),
                interval: dur.as_secs_f64(),
                recurring: false,
                token: Some(token),
            },
        );
        let result = {
            let _guard = RecordGuard {
                inner: &self.inner,
                fiber: me,
            };
            f()
        };
        // the expiry may have been queued while `f` was finishing up
        runtime::with(|rt| {
            let Runtime {
                fibers, run_queue, ..
            } = rt;
            run_queue.remove_token(fibers, me, token);
        });
        (token, result)
    }

    /// Re-arm the current fiber's record to `now + interval`. A silent
    /// no-op when the fiber holds no record on this timer.
    pub fn reset(&self) {
        let me = runtime::current_id();
        let now = clock::monotonic();
        if let Some(record) = self.inner.borrow_mut().records.get_mut(&me) {
            record.deadline = now + record.interval;
        }
    }
}

/// Removes the owning fiber's record on every exit path of a wait scope.
struct RecordGuard<'a> {
    inner: &'a Rc<RefCell<TimerInner>>,
    fiber: FiberId,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.inner.borrow_mut().records.remove(&self.fiber);
    }
}

fn ticker_main(shared: Rc<RefCell<TimerInner>>, resolution: Duration) {
    loop {
        if let Err(e) = sleep(resolution) {
            log::debug!("shared timer ticker stopping: {}", e);
            shared.borrow_mut().ticker = None;
            return;
        }
        let now = clock::monotonic();
        let mut due: Vec<(FiberId, std::result::Result<Wake, Error>)> = Vec::new();
        {
            let mut inner = shared.borrow_mut();
            let mut expired: Vec<FiberId> = Vec::new();
            for (&fiber, record) in inner.records.iter_mut() {
                if record.deadline > now {
                    continue;
                }
                match record.token {
                    Some(token) => due.push((fiber, Err(Error::TimedOut(token)))),
                    None => due.push((fiber, Ok(Wake::Tick))),
                }
                if record.recurring {
                    // collapse missed ticks into the next future deadline
                    while record.deadline <= now {
                        record.deadline += record.interval;
                    }
                } else {
                    expired.push(fiber);
                }
            }
            for fiber in expired {
                inner.records.remove(&fiber);
            }
            if inner.records.is_empty() {
                // park the ticker away; the next waiter respawns it
                inner.ticker = None;
                for (fiber, resume) in due {
                    runtime::schedule(fiber, resume, false);
                }
                return;
            }
        }
        for (fiber, resume) in due {
            runtime::schedule(fiber, resume, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_conversion() {
        let ts = timespec(Duration::new(2, 500_000_000));
        // Timespec has no getters; byte-compare against the expected value
        let expected = types::Timespec::new().sec(2).nsec(500_000_000);
        let a: [u8; 16] = unsafe { std::mem::transmute_copy(&ts) };
        let b: [u8; 16] = unsafe { std::mem::transmute_copy(&expected) };
        assert_eq!(a, b);
    }
}
