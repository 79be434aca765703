use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use spindle::{Error, Timer};

#[test]
fn sleep_zero_yields_once_and_resumes() {
    spindle::run(|| {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let handle = spindle::spawn(move || flag.set(true));

        spindle::sleep(Duration::ZERO).unwrap();
        // the queued fiber got its turn during the yield
        assert!(ran.get());
        handle.join().unwrap();
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn sleep_waits_at_least_the_requested_time() {
    spindle::run(|| {
        let before = Instant::now();
        spindle::sleep(Duration::from_millis(20)).unwrap();
        assert!(before.elapsed() >= Duration::from_millis(20));
    })
    .unwrap();
}

#[test]
fn timeout_interrupts_a_long_sleep() {
    spindle::run(|| {
        let before = Instant::now();
        let result = spindle::timeout(Duration::from_millis(10), || {
            spindle::sleep(Duration::from_secs(30))?;
            Ok(1)
        });
        assert!(matches!(result, Err(Error::TimedOut(_))));
        assert!(before.elapsed() < Duration::from_secs(1));

        // the interrupted sleep settles through its cancellation echo
        spindle::sleep(Duration::from_millis(10)).unwrap();
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn timeout_or_returns_the_move_on_value() {
    spindle::run(|| {
        let result = spindle::timeout_or(Duration::from_millis(10), "oops", || {
            spindle::sleep(Duration::from_secs(30))?;
            Ok("done")
        });
        assert_eq!(result.unwrap(), "oops");
    })
    .unwrap();
}

#[test]
fn fast_blocks_beat_their_deadline() {
    spindle::run(|| {
        let result = spindle::timeout(Duration::from_secs(30), || Ok(42));
        assert_eq!(result.unwrap(), 42);
        // the deadline entry is cancelled by the ensure-path
        spindle::sleep(Duration::from_millis(10)).unwrap();
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn the_innermost_expired_deadline_decides() {
    spindle::run(|| {
        let result = spindle::timeout(Duration::from_secs(30), || {
            let inner = spindle::timeout_or(Duration::from_millis(10), "inner", || {
                spindle::sleep(Duration::from_secs(30))?;
                Ok("never")
            })?;
            Ok(inner)
        });
        // the inner expiry was caught by the inner scope; the outer one
        // never fired
        assert_eq!(result.unwrap(), "inner");
    })
    .unwrap();
}

#[test]
fn timer_loop_is_drift_corrected() {
    spindle::run(|| {
        let ticks = Rc::new(Cell::new(0u32));
        let counter = ticks.clone();
        let result = spindle::timeout_or(Duration::from_millis(55), (), || {
            spindle::timer_loop(Duration::from_millis(10), || {
                counter.set(counter.get() + 1);
                Ok(())
            })
            .map(|_| ())
        });
        result.unwrap();
        assert!((3..=7).contains(&ticks.get()), "ticks = {}", ticks.get());
    })
    .unwrap();
}

#[test]
fn shared_timer_every_ticks_within_a_sleep_window() {
    spindle::run(|| {
        let timer = Timer::new(Duration::from_millis(2));
        let counter = Rc::new(Cell::new(0u32));

        let ticks = counter.clone();
        let result = spindle::timeout_or(Duration::from_millis(50), (), || {
            timer.every(Duration::from_millis(10), || ticks.set(ticks.get() + 1))
                .map(|_| ())
        });
        result.unwrap();
        assert!(
            (3..=6).contains(&counter.get()),
            "ticks = {}",
            counter.get()
        );
    })
    .unwrap();
}

#[test]
fn shared_timer_sleep_and_after() {
    spindle::run(|| {
        let timer = Timer::new(Duration::from_millis(2));

        let before = Instant::now();
        timer.sleep(Duration::from_millis(10)).unwrap();
        assert!(before.elapsed() >= Duration::from_millis(10));

        let handle = timer.after(Duration::from_millis(5), || "after");
        assert_eq!(handle.join().unwrap().unwrap(), "after");
    })
    .unwrap();
}

#[test]
fn cancel_after_raises_on_expiry() {
    spindle::run(|| {
        let timer = Timer::new(Duration::from_millis(2));
        let result = timer.cancel_after(Duration::from_millis(10), || {
            spindle::sleep(Duration::from_secs(30))?;
            Ok(())
        });
        assert!(matches!(result, Err(Error::TimedOut(_))));

        spindle::sleep(Duration::from_millis(10)).unwrap();
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn move_on_after_returns_the_default_on_expiry() {
    spindle::run(|| {
        let timer = Timer::new(Duration::from_millis(2));
        let result = timer.move_on_after(Duration::from_millis(10), 7, || {
            spindle::sleep(Duration::from_secs(30))?;
            Ok(42)
        });
        assert_eq!(result.unwrap(), 7);
    })
    .unwrap();
}

#[test]
fn reset_keeps_postponing_the_deadline() {
    spindle::run(|| {
        let timer = Timer::new(Duration::from_millis(2));
        let iterations = Rc::new(Cell::new(0u32));

        let count = iterations.clone();
        let result = timer.cancel_after(Duration::from_millis(40), || {
            for _ in 0..6 {
                spindle::sleep(Duration::from_millis(10))?;
                count.set(count.get() + 1);
                timer.reset();
            }
            Ok(())
        });
        // 6 x 10ms with a 40ms deadline only survives if every reset
        // re-arms it
        result.unwrap();
        assert_eq!(iterations.get(), 6);
    })
    .unwrap();
}

#[test]
fn reset_without_a_record_is_a_no_op() {
    spindle::run(|| {
        let timer = Timer::new(Duration::from_millis(2));
        timer.reset();
    })
    .unwrap();
}

#[test]
fn deadline_scopes_always_remove_their_record() {
    spindle::run(|| {
        let timer = Timer::new(Duration::from_millis(2));

        // success path
        timer
            .cancel_after(Duration::from_millis(50), || {
                spindle::sleep(Duration::from_millis(5))
            })
            .unwrap();
        // failure path
        let failed: spindle::Result<()> = timer.cancel_after(Duration::from_millis(50), || {
            Err(Error::InvalidArgument("synthetic"))
        });
        assert!(failed.is_err());

        // with no records left the ticker parks itself and the runtime
        // can wind down; a leaked record would hang this sleep's fiber
        // bookkeeping instead
        spindle::sleep(Duration::from_millis(10)).unwrap();
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}
