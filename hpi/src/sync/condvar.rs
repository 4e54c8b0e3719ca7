use std::time::{Duration, Instant};

use parking_lot::{Condvar, MutexGuard};

use crate::{
    error::{HpiError, Result},
    threading::{interrupt::Escape, Thread},
};

/// Millisecond value that the entry-point table maps to an unbounded wait.
pub const WAIT_FOREVER: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Forever,
    Millis(i64),
}

impl Timeout {
    pub fn from_millis(millis: i64) -> Self {
        if millis == WAIT_FOREVER {
            Self::Forever
        } else {
            Self::Millis(millis)
        }
    }

    /// Absolute deadline of the wait, `None` for an unbounded one.
    ///
    /// Non-positive timeouts are rejected before anything blocks.
    pub fn deadline(self) -> Result<Option<Instant>> {
        match self {
            Self::Forever => Ok(None),
            Self::Millis(millis) if millis <= 0 => Err(HpiError::InvalidTimeout(millis)),
            Self::Millis(millis) => {
                Ok(Instant::now().checked_add(Duration::from_millis(millis as u64)))
            }
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::Millis(duration.as_millis().min(i64::MAX as u128 - 1) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
    Interrupted,
}

impl WaitOutcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Woken => Ok(()),
            Self::TimedOut => Err(HpiError::Timeout),
            Self::Interrupted => Err(HpiError::Interrupted),
        }
    }
}

/// Block on `cvar` until `woken` holds, the deadline passes, or the thread is
/// interrupted.
///
/// The deadline is absolute, so early returns of the native wait (spurious
/// wakeups, broadcasts aimed at other waiters, stale escapes) simply loop.
/// `TimedOut` is only reported once the deadline has really passed. An
/// interrupt that is already pending wins over both other outcomes.
///
/// `thread` is left in the `CondvarWait` state: the caller finishes its own
/// bookkeeping under the mutex and then calls
/// [`Thread::leave_condvar_wait`].
pub fn timed_wait<T: ?Sized>(
    thread: Option<&Thread>,
    guard: &mut MutexGuard<'_, T>,
    cvar: &Condvar,
    escape: &dyn Escape,
    deadline: Option<Instant>,
    interruptible: bool,
    mut woken: impl FnMut(&mut T) -> bool,
) -> WaitOutcome {
    let interrupts = thread
        .filter(|_| interruptible)
        .map(|thread| thread.interrupts());
    // armed before the first check, so an interrupt either sees the escape
    // or is seen by the loop below
    let _armed = interrupts.map(|channel| channel.arm(escape));

    if let Some(thread) = thread {
        thread.enter_condvar_wait();
    }

    loop {
        if interrupts.is_some_and(|channel| channel.is_set()) {
            break WaitOutcome::Interrupted;
        }
        if woken(&mut **guard) {
            break WaitOutcome::Woken;
        }
        match deadline {
            None => cvar.wait(guard),
            Some(deadline) => {
                if Instant::now() >= deadline {
                    break WaitOutcome::TimedOut;
                }
                let _ = cvar.wait_until(guard, deadline);
            }
        }
    }
}
