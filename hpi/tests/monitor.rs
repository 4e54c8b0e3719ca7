mod common;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

use common::{attach, eventually};
use hpi::{
    entry::{hpi_thread_interface, RawMonitorInfo},
    threading::OwnerKey,
    HpiError, Monitor, Status, Thread, ThreadState, Timeout,
};
use rand::Rng;

#[test]
fn nested_enters_track_owner_and_count() {
    let guard = attach("nesting");
    let monitor = Monitor::new();

    monitor.enter().unwrap();
    assert_eq!(monitor.owner(), Some(OwnerKey::current()));
    assert_eq!(monitor.entry_count(), 1);
    assert_eq!(
        monitor.owner_thread().map(|t| t.id()),
        Some(guard.thread().id())
    );
    assert_eq!(guard.thread().monitors_owned(), 1);

    for depth in 2..=5 {
        monitor.enter().unwrap();
        assert_eq!(monitor.entry_count(), depth);
    }
    for depth in (0..5).rev() {
        monitor.exit().unwrap();
        assert_eq!(monitor.entry_count(), depth);
    }
    assert_eq!(monitor.owner(), None);
    assert!(!monitor.is_entered());
    assert_eq!(guard.thread().monitors_owned(), 0);
}

#[test]
fn non_owner_is_rejected_without_side_effects() {
    let _guard = attach("owner");
    let monitor = Arc::new(Monitor::new());
    monitor.enter().unwrap();
    monitor.enter().unwrap();

    let m = monitor.clone();
    let results = std::thread::spawn(move || {
        (
            m.exit(),
            m.notify(),
            m.notify_all(),
            m.wait(Timeout::Millis(10)),
            m.is_entered(),
        )
    })
    .join()
    .unwrap();
    assert_eq!(
        results,
        (
            Err(HpiError::NotOwner),
            Err(HpiError::NotOwner),
            Err(HpiError::NotOwner),
            Err(HpiError::NotOwner),
            false
        )
    );

    assert!(monitor.is_entered());
    assert_eq!(monitor.entry_count(), 2);
    monitor.exit().unwrap();
    monitor.exit().unwrap();
    assert_eq!(monitor.exit(), Err(HpiError::NotOwner));
}

#[test]
fn notify_without_waiters_is_ok() {
    let _guard = attach("notifier");
    let monitor = Monitor::new();
    let guard = monitor.lock().unwrap();
    assert_eq!(monitor.notify(), Ok(()));
    assert_eq!(monitor.notify_all(), Ok(()));
    assert_eq!(monitor.waiter_count(), 0);
    drop(guard);
}

#[test]
fn non_positive_timeouts_fail_immediately() {
    let _guard = attach("impatient");
    let monitor = Monitor::new();
    monitor.enter().unwrap();
    let start = Instant::now();
    assert_eq!(
        monitor.wait(Timeout::Millis(0)),
        Err(HpiError::InvalidTimeout(0))
    );
    assert_eq!(
        monitor.wait(Timeout::Millis(-20)),
        Err(HpiError::InvalidTimeout(-20))
    );
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(monitor.is_entered());
    assert_eq!(monitor.entry_count(), 1);
    monitor.exit().unwrap();
}

#[test]
fn timed_wait_never_returns_early() {
    let guard = attach("sleepy");
    let monitor = Monitor::new();
    monitor.enter().unwrap();
    monitor.enter().unwrap();
    for millis in [1, 15, 60] {
        let start = Instant::now();
        assert_eq!(monitor.wait(Timeout::Millis(millis)), Err(HpiError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(millis as u64));
        assert_eq!(monitor.entry_count(), 2);
    }
    assert_eq!(guard.thread().state(), ThreadState::Runnable);
    assert_eq!(guard.thread().waiting_on(), None);
    monitor.exit().unwrap();
    monitor.exit().unwrap();
}

#[test]
fn wait_restores_recursion_depth() {
    let _guard = attach("deep");
    let monitor = Arc::new(Monitor::new());
    for _ in 0..3 {
        monitor.enter().unwrap();
    }

    let m = monitor.clone();
    let notifier = std::thread::spawn(move || {
        let _guard = Thread::attach_current(Some("notifier")).unwrap();
        eventually("a waiter", || m.waiter_count() == 1);
        let guard = m.lock().unwrap();
        assert_eq!(m.entry_count(), 1);
        guard.notify();
    });

    assert_eq!(monitor.wait(Timeout::Forever), Ok(()));
    assert_eq!(monitor.entry_count(), 3);
    assert!(monitor.is_entered());
    notifier.join().unwrap();
    for _ in 0..3 {
        monitor.exit().unwrap();
    }
    assert!(!monitor.in_use());
}

#[test]
fn two_threads_hand_over_the_monitor() {
    let a = attach("a");
    let monitor = Arc::new(Monitor::new());
    let b_exited = Arc::new(AtomicBool::new(false));
    monitor.enter().unwrap();

    let (m, exited) = (monitor.clone(), b_exited.clone());
    let (tx, rx) = mpsc::channel();
    let b = std::thread::spawn(move || {
        let guard = Thread::attach_current(Some("b")).unwrap();
        tx.send(guard.thread().clone()).unwrap();
        // blocks until A waits
        m.enter().unwrap();
        m.notify().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        exited.store(true, Ordering::SeqCst);
        m.exit().unwrap();
    });

    let b_thread = rx.recv().unwrap();
    eventually("b to block entering", || {
        b_thread.state() == ThreadState::MonitorWait
    });
    let info = monitor.info();
    assert_eq!(info.owner.map(|t| t.id()), Some(a.thread().id()));
    assert_eq!(info.entry_count, 1);
    assert!(info.entrants.iter().any(|t| t.id() == b_thread.id()));
    assert_eq!(b_thread.blocked_entering(), Some(monitor.id()));

    assert_eq!(monitor.wait(Timeout::Forever), Ok(()));
    // B still owned the monitor after notifying, so A returns only after B exited
    assert!(b_exited.load(Ordering::SeqCst));
    assert!(monitor.is_entered());
    assert_eq!(monitor.entry_count(), 1);
    monitor.exit().unwrap();
    b.join().unwrap();
    assert_eq!(b_thread.blocked_entering(), None);
}

/// Attach a std thread running `f` and hand its `Thread` back.
fn spawn_attached(
    name: &str,
    f: impl FnOnce() + Send + 'static,
) -> (Arc<Thread>, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let name = name.to_owned();
    let handle = std::thread::spawn(move || {
        let guard = Thread::attach_current(Some(name.as_str())).unwrap();
        tx.send(guard.thread().clone()).unwrap();
        f();
    });
    (rx.recv().unwrap(), handle)
}

#[test]
fn host_info_names_entrants_and_waiters() {
    let host = attach("host");
    let monitor = Arc::new(Monitor::new());

    let m = monitor.clone();
    let (waiter, waiting) = spawn_attached("waiter", move || {
        let guard = m.lock().unwrap();
        guard.wait().unwrap();
    });
    eventually("the waiter", || monitor.waiter_count() == 1);

    monitor.enter().unwrap();
    let m = monitor.clone();
    let (entrant, entering) = spawn_attached("entrant", move || {
        m.enter().unwrap();
        m.exit().unwrap();
    });
    eventually("the entrant to block", || {
        entrant.state() == ThreadState::MonitorWait
    });

    let table = hpi_thread_interface();
    let mut entrants = [std::ptr::null::<Thread>(); 4];
    let mut waiters = [std::ptr::null::<Thread>(); 4];
    let mut info = RawMonitorInfo {
        entrants: entrants.as_mut_ptr(),
        entrants_capacity: entrants.len() as u32,
        waiters: waiters.as_mut_ptr(),
        waiters_capacity: waiters.len() as u32,
        ..RawMonitorInfo::default()
    };
    let status = unsafe { (table.monitor_get_info)(Arc::as_ptr(&monitor), &mut info) };
    assert_eq!(status, Status::Ok);
    assert_eq!(info.owner, Arc::as_ptr(host.thread()));
    assert_eq!(info.entry_count, 1);
    assert_eq!(info.entrant_count, 1);
    assert_eq!(entrants[0], Arc::as_ptr(&entrant));
    assert!(entrants[1].is_null());
    assert_eq!(info.waiter_count, 1);
    assert_eq!(waiters[0], Arc::as_ptr(&waiter));

    // totals are reported even when nothing fits
    let mut counts = RawMonitorInfo::default();
    let status = unsafe { (table.monitor_get_info)(Arc::as_ptr(&monitor), &mut counts) };
    assert_eq!(status, Status::Ok);
    assert_eq!((counts.entrant_count, counts.waiter_count), (1, 1));

    monitor.notify().unwrap();
    monitor.exit().unwrap();
    waiting.join().unwrap();
    entering.join().unwrap();
    assert!(!monitor.in_use());
}

#[test]
fn notify_all_wakes_every_waiter() {
    let _guard = attach("broadcaster");
    let monitor = Arc::new(Monitor::new());
    let woken = Arc::new(AtomicUsize::new(0));

    let waiters: Vec<_> = (0..4)
        .map(|i| {
            let (m, woken) = (monitor.clone(), woken.clone());
            std::thread::spawn(move || {
                let _guard = Thread::attach_current(Some(&format!("waiter-{i}")[..])).unwrap();
                let guard = m.lock().unwrap();
                guard.wait().unwrap();
                woken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    eventually("four waiters", || monitor.waiter_count() == 4);
    {
        let guard = monitor.lock().unwrap();
        let info = monitor.info();
        assert_eq!(info.waiters.len(), 4);
        guard.notify_all();
    }
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 4);
    assert!(!monitor.in_use());
}

#[test]
fn notify_wakes_one_waiter_at_a_time() {
    let _guard = attach("dispatcher");
    let monitor = Arc::new(Monitor::new());
    let woken = Arc::new(AtomicUsize::new(0));

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let (m, woken) = (monitor.clone(), woken.clone());
            std::thread::spawn(move || {
                let guard = m.lock().unwrap();
                guard.wait().unwrap();
                woken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    eventually("three waiters", || monitor.waiter_count() == 3);
    for expected in 1..=3 {
        monitor.synchronized(|guard| guard.notify()).unwrap();
        eventually("one more wakeup", || woken.load(Ordering::SeqCst) == expected);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(woken.load(Ordering::SeqCst), expected);
    }
    for waiter in waiters {
        waiter.join().unwrap();
    }
}

#[test]
fn randomized_nesting_keeps_mutual_exclusion() {
    let _guard = attach("stress");
    let monitor = Arc::new(Monitor::new());
    // updated with a separate load and store, only correct under the monitor
    let counter = Arc::new(AtomicUsize::new(0));
    const THREADS: usize = 6;
    const ROUNDS: usize = 500;

    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let (m, counter) = (monitor.clone(), counter.clone());
            std::thread::spawn(move || {
                let attached = (i % 2 == 0).then(|| Thread::attach_current(None).unwrap());
                let mut rng = rand::rng();
                for _ in 0..ROUNDS {
                    let depth = rng.random_range(1..=4);
                    for _ in 0..depth {
                        m.enter().unwrap();
                    }
                    let value = counter.load(Ordering::Relaxed);
                    if rng.random_bool(0.1) {
                        std::thread::yield_now();
                    }
                    counter.store(value + 1, Ordering::Relaxed);
                    if rng.random_bool(0.05) {
                        let _ = m.wait(Timeout::Millis(1));
                        assert_eq!(m.entry_count(), depth);
                    }
                    m.notify().unwrap();
                    for _ in 0..depth {
                        m.exit().unwrap();
                    }
                }
                drop(attached);
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), THREADS * ROUNDS);
    assert!(!monitor.in_use());
    monitor.destroy().unwrap();
}
