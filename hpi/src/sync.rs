//! Synchronization primitives of the thread subsystem.
//!
//! [`Monitor`] is the recursive lock with an integrated condition variable
//! that backs `synchronized` blocks of the managed language. Waiting goes
//! through [`condvar::timed_wait`], which keeps the thread state visible to
//! the suspension machinery and lets [`interrupt`](crate::threading::Thread::interrupt)
//! force the wait to return early.
pub mod condvar;
pub mod monitor;
pub mod wait_queue;

pub use condvar::{Timeout, WaitOutcome, WAIT_FOREVER};
pub use monitor::*;
