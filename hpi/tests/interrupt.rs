mod common;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

use common::{attach, eventually};
use hpi::{HpiError, Monitor, Thread, ThreadState, Timeout};
use parking_lot::{Condvar, Mutex};

/// Spawn an attached std thread, handing its `Thread` back to the caller.
fn spawn_attached<R: Send + 'static>(
    name: &str,
    f: impl FnOnce(&Thread) -> R + Send + 'static,
) -> (Arc<Thread>, std::thread::JoinHandle<R>) {
    let (tx, rx) = mpsc::channel();
    let name = name.to_owned();
    let handle = std::thread::spawn(move || {
        let guard = Thread::attach_current(Some(name.as_str())).unwrap();
        tx.send(guard.thread().clone()).unwrap();
        f(guard.thread())
    });
    (rx.recv().unwrap(), handle)
}

#[test]
fn interrupt_wakes_a_monitor_waiter() {
    let _guard = attach("interrupter");
    let monitor = Arc::new(Monitor::new());

    let m = monitor.clone();
    let (waiter, handle) = spawn_attached("waiter", move |me| {
        let guard = m.lock().unwrap();
        let result = guard.wait();
        assert!(m.is_entered());
        drop(guard);
        (result, me.is_interrupted(true), me.is_interrupted(true))
    });

    eventually("the waiter", || {
        waiter.waiting_on() == Some(monitor.id()) && waiter.state() == ThreadState::CondvarWait
    });
    waiter.interrupt();
    let (result, first, second) = handle.join().unwrap();
    assert_eq!(result, Err(HpiError::Interrupted));
    assert!(first);
    assert!(!second);
    assert_eq!(monitor.waiter_count(), 0);
}

#[test]
fn interrupted_waiter_reacquires_after_the_owner_exits() {
    let _guard = attach("holder");
    let monitor = Arc::new(Monitor::new());
    let released = Arc::new(AtomicBool::new(false));

    let (m, r) = (monitor.clone(), released.clone());
    let (waiter, handle) = spawn_attached("waiter", move |_| {
        m.enter().unwrap();
        let result = m.wait(Timeout::Forever);
        let saw_release = r.load(Ordering::SeqCst);
        m.exit().unwrap();
        (result, saw_release)
    });

    eventually("the waiter", || monitor.waiter_count() == 1);
    monitor.enter().unwrap();
    // interrupting while owning the monitor must not deadlock
    waiter.interrupt();
    std::thread::sleep(Duration::from_millis(20));
    released.store(true, Ordering::SeqCst);
    monitor.exit().unwrap();

    let (result, saw_release) = handle.join().unwrap();
    assert_eq!(result, Err(HpiError::Interrupted));
    assert!(saw_release);
}

#[test]
fn interrupt_reaches_a_waiter_while_a_third_thread_owns_the_monitor() {
    let _guard = attach("bystander");
    let monitor = Arc::new(Monitor::new());
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let m = monitor.clone();
    let (waiter, waiting) = spawn_attached("waiter", move |_| {
        let guard = m.lock().unwrap();
        guard.wait()
    });
    eventually("the waiter", || monitor.waiter_count() == 1);

    let m = monitor.clone();
    let (_, holder) = spawn_attached("holder", move |_| {
        let guard = m.lock().unwrap();
        release_rx.recv().unwrap();
        drop(guard);
    });
    eventually("the holder", || monitor.owner().is_some());

    let interrupter = std::thread::spawn({
        let waiter = waiter.clone();
        move || waiter.interrupt()
    });
    interrupter.join().unwrap();
    release_tx.send(()).unwrap();
    holder.join().unwrap();
    assert_eq!(waiting.join().unwrap(), Err(HpiError::Interrupted));
}

#[test]
fn pending_interrupt_fails_the_wait_at_once() {
    let guard = attach("impatient");
    let monitor = Monitor::new();
    guard.thread().interrupt();

    monitor.enter().unwrap();
    let start = Instant::now();
    assert_eq!(monitor.wait(Timeout::Forever), Err(HpiError::Interrupted));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(monitor.is_entered());
    monitor.exit().unwrap();

    // wait reports the interrupt without consuming it
    assert!(guard.thread().is_interrupted(false));
    assert!(guard.thread().is_interrupted(true));
    assert!(!guard.thread().is_interrupted(false));
}

#[test]
fn interruptible_sleep_is_cut_short() {
    let _guard = attach("alarm");
    let (sleeper, handle) = spawn_attached("sleeper", |_| {
        let start = Instant::now();
        let result = Thread::sleep(60_000, true);
        (result, start.elapsed())
    });

    eventually("the sleeper", || sleeper.state() == ThreadState::CondvarWait);
    sleeper.interrupt();
    let (result, elapsed) = handle.join().unwrap();
    assert_eq!(result, Err(HpiError::Interrupted));
    assert!(elapsed < Duration::from_secs(30));
}

#[test]
fn uninterruptible_sleep_runs_to_the_end() {
    let guard = attach("sleeper");
    guard.thread().interrupt();
    let start = Instant::now();
    assert_eq!(Thread::sleep(30, false), Ok(()));
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(guard.thread().is_interrupted(true));
    assert_eq!(Thread::sleep(0, true), Ok(()));
}

#[test]
fn blocking_call_is_escaped_by_an_interrupt() {
    struct Doorbell {
        rung: Mutex<bool>,
        cvar: Condvar,
    }

    impl hpi::threading::interrupt::Escape for Doorbell {
        fn try_escape(&self) -> bool {
            *self.rung.lock() = true;
            self.cvar.notify_all();
            true
        }
    }

    let _guard = attach("caller");
    let (caller, handle) = spawn_attached("blocked", |me| {
        let doorbell = Doorbell {
            rung: Mutex::new(false),
            cvar: Condvar::new(),
        };
        me.interrupts().blocking_call(&doorbell, |_| {
            let mut rung = doorbell.rung.lock();
            while !*rung {
                doorbell.cvar.wait(&mut rung);
            }
        })
    });

    std::thread::sleep(Duration::from_millis(10));
    caller.interrupt();
    // either the escape rang the bell, or the interrupt was seen before arming
    match handle.join().unwrap() {
        Ok(()) | Err(HpiError::Interrupted) => {}
        other => panic!("unexpected {other:?}"),
    }
}
