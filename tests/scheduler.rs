use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use spindle::{Error, Fiber};

#[test]
fn run_returns_the_root_value() {
    let value = spindle::run(|| 123).unwrap();
    assert_eq!(value, 123);
}

#[test]
fn run_can_be_called_again_on_the_same_thread() {
    spindle::run(|| {}).unwrap();
    spindle::run(|| {}).unwrap();
}

#[test]
fn nested_run_is_rejected() {
    let result = spindle::run(|| spindle::run(|| {})).unwrap();
    assert!(matches!(result, Err(Error::NestedRuntime)));
}

#[test]
fn root_panic_is_caught() {
    let result = spindle::run(|| panic!("boom"));
    assert!(matches!(result, Err(Error::FiberPanicked)));
}

#[test]
fn join_returns_the_child_value() {
    spindle::run(|| {
        let handle = spindle::spawn(|| 7 * 6);
        assert_eq!(handle.join().unwrap(), 42);
    })
    .unwrap();
}

#[test]
fn join_surfaces_a_child_panic() {
    spindle::run(|| {
        let handle = spindle::spawn(|| panic!("inner"));
        assert!(matches!(handle.join(), Err(Error::FiberPanicked)));
    })
    .unwrap();
}

#[test]
fn join_after_the_child_finished() {
    spindle::run(|| {
        let handle = spindle::spawn(|| "done");
        spindle::yield_now().unwrap();
        assert_eq!(handle.join().unwrap(), "done");
    })
    .unwrap();
}

#[test]
fn spawned_fibers_run_in_fifo_order() {
    spindle::run(|| {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let order = order.clone();
            handles.push(spindle::spawn(move || order.borrow_mut().push(i)));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    })
    .unwrap();
}

#[test]
fn yield_now_lets_other_fibers_run() {
    spindle::run(|| {
        let seen = Rc::new(Cell::new(false));
        let flag = seen.clone();
        let handle = spindle::spawn(move || flag.set(true));

        assert!(!seen.get());
        spindle::yield_now().unwrap();
        assert!(seen.get());
        handle.join().unwrap();
    })
    .unwrap();
}

#[test]
fn run_waits_for_dropped_children() {
    let done = spindle::run(|| {
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        drop(spindle::spawn(move || {
            spindle::sleep(Duration::from_millis(5)).unwrap();
            flag.set(true);
        }));
        done
    })
    .unwrap();
    assert!(done.get());
}

#[test]
fn cancel_interrupts_a_sleeping_fiber() {
    spindle::run(|| {
        let handle = spindle::spawn(|| spindle::sleep(Duration::from_secs(30)));
        spindle::yield_now().unwrap();

        handle.cancel();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        // the backend keeps working after the cancellation
        spindle::sleep(Duration::from_millis(5)).unwrap();
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn cancelling_a_dead_fiber_is_a_no_op() {
    spindle::run(|| {
        let handle = spindle::spawn(|| ());
        let fiber = handle.fiber();
        handle.join().unwrap();
        assert!(!fiber.is_alive());
        fiber.cancel();
        fiber.wakeup();
    })
    .unwrap();
}

#[test]
fn wakeup_resumes_a_suspended_fiber() {
    spindle::run(|| {
        let target: Rc<RefCell<Option<Fiber>>> = Rc::new(RefCell::new(None));
        let shared = target.clone();
        let handle = spindle::spawn(move || {
            *shared.borrow_mut() = Some(Fiber::current());
            spindle::suspend()
        });
        spindle::yield_now().unwrap();

        target.borrow().as_ref().unwrap().wakeup();
        let wake = handle.join().unwrap().unwrap();
        assert_eq!(wake, spindle::Wake::Unit);
    })
    .unwrap();
}

#[test]
fn unschedule_removes_a_queued_wakeup() {
    spindle::run(|| {
        let target: Rc<RefCell<Option<Fiber>>> = Rc::new(RefCell::new(None));
        let woke = Rc::new(Cell::new(false));

        let shared = target.clone();
        let woke_flag = woke.clone();
        let handle = spindle::spawn(move || {
            *shared.borrow_mut() = Some(Fiber::current());
            let _ = spindle::suspend();
            woke_flag.set(true);
        });
        spindle::yield_now().unwrap();

        let fiber = target.borrow().as_ref().unwrap().clone();
        fiber.wakeup();
        fiber.unschedule();

        // give it plenty of chances to (wrongly) run
        for _ in 0..3 {
            spindle::yield_now().unwrap();
        }
        assert!(!woke.get());

        fiber.wakeup();
        handle.join().unwrap();
        assert!(woke.get());
    })
    .unwrap();
}
