#![allow(dead_code)]

use std::time::{Duration, Instant};

use hpi::{threading::AttachGuard, DefaultHost, Hpi, Thread};

pub fn bootstrap() -> &'static Hpi {
    let _ = env_logger::builder().is_test(true).try_init();
    Hpi::ensure_bootstrapped(|| DefaultHost).expect("bootstrap")
}

/// Attach the calling test thread.
pub fn attach(name: &str) -> AttachGuard {
    bootstrap();
    Thread::attach_current(Some(name)).expect("attach")
}

/// Spin until `condition` holds, failing the test after ten seconds.
pub fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
