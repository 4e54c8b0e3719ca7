//! Suspend/resume and stop-the-world.
//!
//! A thread can be parked in two ways:
//!
//! - Running threads (including those blocked entering a monitor) are sent
//!   the rendezvous signal. The handler records the register state from its
//!   `ucontext`, acknowledges on the thread's ack semaphore and blocks on the
//!   resume semaphore until a wakeup is requested.
//! - Threads in an interruptible condvar wait are only marked. They are not
//!   touching managed state, and the snapshot taken when they started waiting
//!   stays valid; the thread parks itself at the end of the wait.
//!
//! Both paths, and the self-suspend at a poll point, use the same pair of
//! semaphores, so `resume` does not care how a thread was parked.
//!
//! No thread may be parked while holding a lock a suspender needs. Suspending
//! or resuming another thread is serialized on the controller, and a thread
//! holding that lock is never signalled. Every other thread takes suspension
//! locks with the signal blocked.
use std::{
    cell::UnsafeCell,
    ffi::c_void,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
        Arc,
    },
};

use atomic::Atomic;
use parking_lot::{Mutex, MutexGuard};

use super::{registry::ThreadRegistry, try_current_thread, Thread, ThreadState};
use crate::{
    error::{HpiError, Result},
    machine_context::RegisterSnapshot,
    options::Options,
    roots::{RootSnapshot, ThreadRoots},
    semaphore::Semaphore,
    stack_bounds::current_stack_pointer,
};

/// Nesting depth of suspensions. Never goes below zero.
pub struct SuspendCount(AtomicU32);

impl SuspendCount {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set_initial(&self, count: u32) {
        self.0.store(count, Ordering::Release);
    }

    /// Returns the count before the increment.
    pub fn increment(&self) -> Result<u32> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .map_err(|_| HpiError::SuspendOverflow)
    }

    /// Returns the count after the decrement, `None` if it was already zero.
    pub fn decrement(&self) -> Option<u32> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }
}

impl Default for SuspendCount {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a thread is in the signal rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SuspendPhase {
    Running,
    Requested,
    Suspended,
    WakeupRequested,
}

unsafe impl bytemuck::NoUninit for SuspendPhase {}

/// Signal installed by the last [`SuspendController::install`], zero if none.
static RENDEZVOUS_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Keeps the rendezvous signal blocked on the calling thread until dropped.
struct SignalBlock {
    previous: libc::sigset_t,
    active: bool,
}

impl SignalBlock {
    fn new() -> Self {
        let signal = RENDEZVOUS_SIGNAL.load(Ordering::Acquire);
        unsafe {
            let mut previous: libc::sigset_t = std::mem::zeroed();
            if signal == 0 {
                return Self {
                    previous,
                    active: false,
                };
            }
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, signal);
            let active = libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous) == 0;
            Self { previous, active }
        }
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        if self.active {
            unsafe {
                libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
            }
        }
    }
}

/// A suspension lock held with the rendezvous signal blocked. The lock is
/// released before the signal is unblocked, so a pending rendezvous is
/// handled outside it.
struct MaskedLock<'a> {
    _lock: MutexGuard<'a, ()>,
    _block: SignalBlock,
}

/// Suspension state embedded in every [`Thread`].
///
/// `count`, `pending` and the snapshot are changed only while holding
/// `lock`, except for the signal handler, which writes the snapshot while
/// its suspender waits for the ack. Threads that may be signalled take
/// `lock` with the rendezvous signal blocked. Suspenders never wait for an
/// ack while holding it.
pub(crate) struct Suspension {
    lock: Mutex<()>,
    pub(crate) count: SuspendCount,
    phase: Atomic<SuspendPhase>,
    pending: AtomicBool,
    resume_sema: Semaphore,
    ack_sema: Semaphore,
    snapshot: UnsafeCell<RootSnapshot>,
    snapshot_valid: AtomicBool,
}

unsafe impl Sync for Suspension {}

impl Suspension {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            count: SuspendCount::new(),
            phase: Atomic::new(SuspendPhase::Running),
            pending: AtomicBool::new(false),
            resume_sema: Semaphore::new(0),
            ack_sema: Semaphore::new(0),
            snapshot: UnsafeCell::new(RootSnapshot::default()),
            snapshot_valid: AtomicBool::new(false),
        }
    }

    /// Take `lock` with the rendezvous signal blocked, so the caller cannot
    /// be parked while holding it.
    fn lock_masked(&self) -> MaskedLock<'_> {
        let block = SignalBlock::new();
        MaskedLock {
            _lock: self.lock.lock(),
            _block: block,
        }
    }

    pub(crate) fn snapshot(&self) -> Option<RootSnapshot> {
        let _lock = self.lock_masked();
        if !self.snapshot_valid.load(Ordering::Acquire) {
            return None;
        }
        Some(unsafe { *self.snapshot.get() })
    }

    /// # Safety
    ///
    /// Only the owning thread writes the snapshot, and only while nobody can
    /// read it: with `lock` held, or in the signal handler before the ack.
    unsafe fn save_snapshot(&self, snapshot: RootSnapshot) {
        unsafe { self.stash_snapshot(snapshot) };
        self.snapshot_valid.store(true, Ordering::Release);
    }

    /// Like [`save_snapshot`](Self::save_snapshot), but leaves the snapshot
    /// invalid until a suspender validates it. Replaces any snapshot a
    /// suspender validated earlier.
    unsafe fn stash_snapshot(&self, snapshot: RootSnapshot) {
        self.clear_snapshot();
        unsafe { self.snapshot.get().write(snapshot) };
    }

    fn clear_snapshot(&self) {
        self.snapshot_valid.store(false, Ordering::Release);
    }

    pub(crate) fn wait_for_ack(&self) {
        self.ack_sema.wait();
    }

    /// Block on the resume semaphore until a wakeup is requested, then run
    /// `before_ack` and acknowledge. Async-signal-safe.
    fn await_wakeup(&self, before_ack: impl FnOnce()) {
        loop {
            self.resume_sema.wait();
            if self.phase.load(Ordering::SeqCst) == SuspendPhase::WakeupRequested {
                break;
            }
        }
        before_ack();
        self.phase.store(SuspendPhase::Running, Ordering::SeqCst);
        self.ack_sema.post();
    }
}

impl Thread {
    /// Poll point: park here if a suspension is pending.
    pub fn poll(&self) {
        debug_assert!(self.is_current(), "poll on behalf of another thread");
        if self.suspension.count.get() > 0 {
            self.park(false);
        }
    }

    /// First park of a created thread. Acknowledges the creator even if a
    /// resume already arrived.
    pub(crate) fn park_initial(&self) {
        self.park(true);
    }

    fn park(&self, initial: bool) {
        let s = &self.suspension;
        let lock = s.lock_masked();
        if s.count.get() == 0 {
            drop(lock);
            if initial {
                s.ack_sema.post();
            }
            return;
        }
        s.pending.store(false, Ordering::Relaxed);
        // a condvar waiter marked by a suspender still holds the snapshot
        // from the start of its wait
        unsafe { s.save_snapshot(RootSnapshot::capture()) };
        let previous = self.stored_state();
        self.set_state(ThreadState::Suspended);
        // A suspender that signalled us while we held the lock waits for an
        // ack; the signal itself finds the phase changed and does nothing.
        let requested = s.phase.swap(SuspendPhase::Suspended, Ordering::SeqCst)
            == SuspendPhase::Requested;
        drop(lock);

        if initial || requested {
            s.ack_sema.post();
        }
        s.await_wakeup(|| self.set_state(previous));
    }

    /// Enter `CondvarWait`. The snapshot taken here is what a suspender
    /// reports while the thread stays blocked.
    pub(crate) fn enter_condvar_wait(&self) {
        let s = &self.suspension;
        let _lock = s.lock_masked();
        unsafe { s.stash_snapshot(RootSnapshot::capture()) };
        self.set_state(ThreadState::CondvarWait);
    }

    /// Leave `CondvarWait`. Returns whether a suspension arrived in the
    /// meantime and the thread must park.
    pub(crate) fn finish_condvar_wait(&self) -> bool {
        let s = &self.suspension;
        let _lock = s.lock_masked();
        self.set_state(ThreadState::Runnable);
        if s.pending.load(Ordering::Relaxed) {
            true
        } else {
            s.clear_snapshot();
            false
        }
    }

    /// Mark the thread as terminating. Suspenders give up on it from here on.
    pub(crate) fn mark_about_to_terminate(&self) {
        let _lock = self.suspension.lock_masked();
        self.about_to_terminate.store(true, Ordering::Release);
    }

    /// Body of the rendezvous signal handler.
    ///
    /// # Safety
    ///
    /// Must run on `self`'s OS thread, inside the handler that received
    /// `context`.
    unsafe fn park_from_signal(&self, context: *const libc::ucontext_t) {
        let s = &self.suspension;
        if s.phase.load(Ordering::SeqCst) != SuspendPhase::Requested {
            return;
        }
        let snapshot = RootSnapshot {
            stack_pointer: current_stack_pointer(),
            registers: unsafe { RegisterSnapshot::from_ucontext(context) },
        };
        unsafe { s.save_snapshot(snapshot) };
        let previous = self.stored_state();
        self.set_state(ThreadState::Suspended);
        s.phase.store(SuspendPhase::Suspended, Ordering::SeqCst);
        s.ack_sema.post();
        s.await_wakeup(|| self.set_state(previous));
    }
}

extern "C" fn suspend_signal_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    let saved = errno::errno();
    if let Some(thread) = try_current_thread() {
        unsafe { thread.park_from_signal(context.cast()) };
    }
    errno::set_errno(saved);
}

/// Drives suspension of single threads and of the whole world.
pub struct SuspendController {
    signal: libc::c_int,
    max_rounds: usize,
    previous_action: Mutex<Option<libc::sigaction>>,
    /// Held by whoever suspends or resumes another thread, for the whole of
    /// a `suspend_all` walk, and around every access to `world`. Its holder
    /// is never sent the rendezvous signal.
    ops: Mutex<()>,
    world: Mutex<Option<Vec<Arc<Thread>>>>,
}

impl SuspendController {
    pub(crate) fn new(options: &Options) -> Self {
        Self {
            signal: options.suspend_signal,
            max_rounds: options.max_suspend_rounds.max(1),
            previous_action: Mutex::new(None),
            ops: Mutex::new(()),
            world: Mutex::new(None),
        }
    }

    pub fn signal(&self) -> libc::c_int {
        self.signal
    }

    pub(crate) fn install(&self) -> Result<()> {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = suspend_signal_handler as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(self.signal, &action, &mut previous) != 0 {
                return Err(HpiError::Signal(errno::errno()));
            }
            *self.previous_action.lock() = Some(previous);
        }
        RENDEZVOUS_SIGNAL.store(self.signal, Ordering::Release);
        Ok(())
    }

    /// Restore the signal disposition found by [`install`](Self::install).
    pub(crate) fn uninstall(&self) {
        if let Some(previous) = self.previous_action.lock().take() {
            unsafe {
                libc::sigaction(self.signal, &previous, std::ptr::null_mut());
            }
            let _ = RENDEZVOUS_SIGNAL.compare_exchange(
                self.signal,
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Take `ops` without ever queueing on it: a thread queued inside the
    /// lock's slow path must not be parked by the signal.
    fn lock_ops(&self) -> MutexGuard<'_, ()> {
        loop {
            if let Some(guard) = self.ops.try_lock() {
                return guard;
            }
            std::thread::yield_now();
        }
    }

    /// Suspend `target`, nesting with earlier suspensions.
    ///
    /// Returns once the target is parked, except for a target in a condvar
    /// wait, which parks when its wait ends. A thread suspending itself parks
    /// before this returns.
    pub fn suspend(&self, target: &Thread) -> Result<()> {
        if target.is_current() {
            let s = &target.suspension;
            {
                let _lock = s.lock_masked();
                s.count.increment()?;
                s.pending.store(true, Ordering::Relaxed);
            }
            target.poll();
            return Ok(());
        }
        let _ops = self.lock_ops();
        self.suspend_other(target)
    }

    /// Caller holds `ops`.
    fn suspend_other(&self, target: &Thread) -> Result<()> {
        let s = &target.suspension;
        let lock = s.lock.lock();
        if target.is_about_to_terminate() {
            return Err(HpiError::ThreadNotAlive);
        }
        if s.count.increment()? > 0 {
            return Ok(());
        }

        match target.stored_state() {
            ThreadState::CondvarWait => {
                s.pending.store(true, Ordering::Relaxed);
                s.snapshot_valid.store(true, Ordering::Release);
                Ok(())
            }
            _ => {
                s.phase.store(SuspendPhase::Requested, Ordering::SeqCst);
                let rc = unsafe { libc::pthread_kill(target.native_handle(), self.signal) };
                if rc != 0 {
                    s.phase.store(SuspendPhase::Running, Ordering::SeqCst);
                    s.count.decrement();
                    return Err(HpiError::Signal(errno::Errno(rc)));
                }
                // the target may need its own lock before it can take the signal
                drop(lock);
                s.ack_sema.wait();
                Ok(())
            }
        }
    }

    /// Undo one suspension. The thread runs again once the count reaches
    /// zero. Resuming a thread that is not suspended does nothing.
    pub fn resume(&self, target: &Thread) -> Result<()> {
        let _ops = self.lock_ops();
        self.resume_other(target)
    }

    /// Caller holds `ops`.
    fn resume_other(&self, target: &Thread) -> Result<()> {
        let s = &target.suspension;
        let lock = s.lock.lock();
        let Some(remaining) = s.count.decrement() else {
            log::warn!("ignoring resume of thread {target}, it is not suspended");
            return Ok(());
        };
        if remaining > 0 {
            return Ok(());
        }
        s.pending.store(false, Ordering::Relaxed);
        s.clear_snapshot();
        if s.phase.load(Ordering::SeqCst) == SuspendPhase::Suspended {
            s.phase
                .store(SuspendPhase::WakeupRequested, Ordering::SeqCst);
            s.resume_sema.post();
            drop(lock);
            s.ack_sema.wait();
        }
        Ok(())
    }

    pub fn is_world_stopped(&self) -> bool {
        let _ops = self.lock_ops();
        self.world.lock().is_some()
    }

    /// Suspend every registered thread except the caller and return their
    /// roots.
    ///
    /// The registry is enumerated until a round finds no thread that is not
    /// yet suspended; at most `max_suspend_rounds` rounds suspend threads,
    /// and one more may only confirm. If any suspension fails, the threads
    /// suspended so far are resumed and the error is returned.
    pub fn suspend_all(&self, registry: &ThreadRegistry) -> Result<Vec<ThreadRoots>> {
        let _ops = self.lock_ops();
        let mut world = self.world.lock();
        if world.is_some() {
            return Err(HpiError::WorldAlreadyStopped);
        }
        log::debug!("stopping the world");

        let me = try_current_thread().map(Thread::id);
        let registry_guard = registry.lock()?;
        // Nothing below may allocate once the first thread is parked: it could
        // be holding an allocator lock. The registry cannot grow while we
        // hold its lock, so its size bounds every buffer.
        let population = registry.len();
        let mut suspended: Vec<Arc<Thread>> = Vec::with_capacity(population);
        let mut fresh: Vec<Arc<Thread>> = Vec::with_capacity(population);
        let mut roots = Vec::with_capacity(population);

        let mut stable = false;
        for round in 0..=self.max_rounds {
            fresh.clear();
            registry.for_each(|thread| {
                if Some(thread.id()) != me
                    && !thread.is_about_to_terminate()
                    && !suspended.iter().any(|s| Arc::ptr_eq(s, thread))
                {
                    fresh.push(thread.clone());
                }
            });
            if fresh.is_empty() {
                stable = true;
                break;
            }
            if round == self.max_rounds {
                break;
            }
            for thread in fresh.drain(..) {
                match self.suspend_other(&thread) {
                    Ok(()) => suspended.push(thread),
                    Err(HpiError::ThreadNotAlive) => {}
                    Err(err) => {
                        drop(registry_guard);
                        self.rollback(&suspended);
                        return Err(err);
                    }
                }
            }
        }
        drop(registry_guard);

        if !stable {
            self.rollback(&suspended);
            return Err(HpiError::UnstableThreadSet(self.max_rounds));
        }

        roots.extend(suspended.iter().filter_map(|thread| thread.roots()));
        *world = Some(suspended);
        Ok(roots)
    }

    /// Caller holds `ops`.
    fn rollback(&self, suspended: &[Arc<Thread>]) {
        log::debug!("rolling back {} suspension(s)", suspended.len());
        for thread in suspended.iter().rev() {
            let _ = self.resume_other(thread);
        }
    }

    /// Resume every thread parked by [`suspend_all`](Self::suspend_all).
    pub fn resume_all(&self) -> Result<()> {
        let _ops = self.lock_ops();
        let Some(threads) = self.world.lock().take() else {
            log::warn!("resume_all without a stopped world");
            return Err(HpiError::WorldNotStopped);
        };
        for thread in &threads {
            let _lock = thread.suspension.lock.lock();
            thread.suspension.clear_snapshot();
        }
        for thread in &threads {
            self.resume_other(thread)?;
        }
        log::debug!("world resumed, {} thread(s)", threads.len());
        Ok(())
    }

    /// Stop the world until the returned guard is dropped.
    pub fn stop_the_world<'a>(&'a self, registry: &ThreadRegistry) -> Result<StopTheWorld<'a>> {
        let roots = self.suspend_all(registry)?;
        Ok(StopTheWorld {
            controller: self,
            roots,
        })
    }
}

pub struct StopTheWorld<'a> {
    controller: &'a SuspendController,
    roots: Vec<ThreadRoots>,
}

impl StopTheWorld<'_> {
    pub fn roots(&self) -> &[ThreadRoots] {
        &self.roots
    }
}

impl Drop for StopTheWorld<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.controller.resume_all() {
            log::error!("failed to restart the world: {err}");
        }
    }
}
