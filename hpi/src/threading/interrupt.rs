use std::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::error::{HpiError, Result};

/// A way to force a blocked call to return.
///
/// The blocked thread arms its [`InterruptChannel`] with an escape for the
/// duration of the call. [`InterruptChannel::interrupt`] invokes it from the
/// interrupting thread.
pub trait Escape: Sync {
    /// Wake the blocked call. Returning `false` means the escape could not be
    /// delivered right now and the interrupter retries.
    fn try_escape(&self) -> bool;
}

#[derive(Clone, Copy)]
struct EscapeToken(NonNull<dyn Escape>);

unsafe impl Send for EscapeToken {}

/// Interrupt flag of a thread plus the escape armed while it blocks.
pub struct InterruptChannel {
    interrupted: AtomicBool,
    escape: Mutex<Option<EscapeToken>>,
}

impl Default for InterruptChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptChannel {
    pub const fn new() -> Self {
        Self {
            interrupted: AtomicBool::new(false),
            escape: Mutex::new(None),
        }
    }

    pub fn is_set(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Set the flag and wake the blocked call, if any.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        loop {
            let escape = self.escape.lock();
            let Some(token) = *escape else {
                return;
            };
            // SAFETY: the token is disarmed before the escape it points to is
            // dropped, and disarming needs the lock we hold.
            if unsafe { token.0.as_ref() }.try_escape() {
                return;
            }
            drop(escape);
            std::thread::yield_now();
        }
    }

    /// Read the flag, clearing it when `clear` is set.
    pub fn is_interrupted(&self, clear: bool) -> bool {
        if !clear {
            return self.is_set();
        }
        let _escape = self.escape.lock();
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Arm `escape` until the returned guard is dropped.
    pub fn arm<'a>(&'a self, escape: &'a dyn Escape) -> ArmedEscape<'a> {
        // SAFETY: only the lifetime is erased. `ArmedEscape` borrows the
        // escape for 'a and clears the token on drop.
        let escape: &'static dyn Escape = unsafe { std::mem::transmute(escape) };
        let mut slot = self.escape.lock();
        debug_assert!(slot.is_none(), "nested interruptible calls");
        *slot = Some(EscapeToken(NonNull::from(escape)));
        ArmedEscape { channel: self }
    }

    /// Run `f` as an interruptible blocking call.
    ///
    /// `escape` must make `f` return when fired. `f` receives the channel to
    /// tell an escape apart from a normal return. A flag that is already set
    /// fails the call without running `f`.
    pub fn blocking_call<R>(
        &self,
        escape: &dyn Escape,
        f: impl FnOnce(&InterruptChannel) -> R,
    ) -> Result<R> {
        let _armed = self.arm(escape);
        if self.is_set() {
            return Err(HpiError::Interrupted);
        }
        Ok(f(self))
    }
}

pub struct ArmedEscape<'a> {
    channel: &'a InterruptChannel,
}

impl Drop for ArmedEscape<'_> {
    fn drop(&mut self) {
        *self.channel.escape.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, Arc};

    use super::*;

    struct CountingEscape {
        fired: AtomicUsize,
        accept_after: usize,
    }

    impl Escape for CountingEscape {
        fn try_escape(&self) -> bool {
            self.fired.fetch_add(1, Ordering::SeqCst) + 1 >= self.accept_after
        }
    }

    #[test]
    fn flag_is_cleared_once() {
        let channel = InterruptChannel::new();
        channel.interrupt();
        assert!(channel.is_interrupted(false));
        assert!(channel.is_interrupted(true));
        assert!(!channel.is_interrupted(true));
    }

    #[test]
    fn armed_escape_is_retried() {
        let channel = InterruptChannel::new();
        let escape = CountingEscape {
            fired: AtomicUsize::new(0),
            accept_after: 3,
        };
        {
            let _armed = channel.arm(&escape);
            channel.interrupt();
        }
        assert_eq!(escape.fired.load(Ordering::SeqCst), 3);
        // disarmed: a second interrupt only sets the flag
        channel.interrupt();
        assert_eq!(escape.fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn pending_interrupt_skips_blocking_call() {
        let channel = InterruptChannel::new();
        let escape = CountingEscape {
            fired: AtomicUsize::new(0),
            accept_after: 1,
        };
        channel.interrupt();
        let ran = channel.blocking_call(&escape, |_| true);
        assert_eq!(ran, Err(HpiError::Interrupted));
    }

    #[test]
    fn blocking_call_is_woken() {
        struct Flag(parking_lot::Mutex<bool>, parking_lot::Condvar);
        impl Escape for Flag {
            fn try_escape(&self) -> bool {
                *self.0.lock() = true;
                self.1.notify_all();
                true
            }
        }

        let channel = Arc::new(InterruptChannel::new());
        let flag = Arc::new(Flag(parking_lot::Mutex::new(false), parking_lot::Condvar::new()));
        let (c, f) = (channel.clone(), flag.clone());
        let waiter = std::thread::spawn(move || {
            c.blocking_call(&*f, |channel| {
                let mut woken = f.0.lock();
                while !*woken {
                    f.1.wait(&mut woken);
                }
                channel.is_set()
            })
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        channel.interrupt();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Ok(true) | Err(HpiError::Interrupted)));
    }
}
