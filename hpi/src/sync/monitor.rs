use std::{
    alloc::Layout,
    marker::PhantomData,
    mem::{ManuallyDrop, MaybeUninit},
    pin::pin,
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{
    condvar::{self, Timeout, WaitOutcome},
    wait_queue::{WaitQueue, WaiterRecord},
};
use crate::{
    error::{HpiError, Result},
    threading::{interrupt::Escape, try_current_thread, OwnerKey, Thread},
    Hpi,
};

/// Serializes lazy allocation of native monitors. Usable before the thread
/// subsystem is bootstrapped.
static NATIVE_INIT_LOCK: Mutex<()> = Mutex::new(());

/// Identity of a monitor, used for weak back-references from threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorId(pub(crate) usize);

impl MonitorId {
    pub(crate) fn from_raw(raw: usize) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn addr(self) -> usize {
        self.0
    }
}

struct NativeMonitor {
    mutex: Mutex<WaitQueue>,
    cvar: Condvar,
}

/// Recursive lock with an integrated condition variable, the native half of
/// a `synchronized` block.
///
/// The monitor is built from a non-reentrant `parking_lot` mutex and condvar:
/// <ul>
/// <li>The owner holds the native mutex for as long as it owns the monitor.
///     Re-entering only bumps the entry count.</li>
/// <li>`wait` releases the monitor completely and restores the full entry
///     count once it reacquires it.</li>
/// <li>The native half is allocated on first use, so a monitor can be placed
///     in caller-provided storage with [`Monitor::new`] or
///     [`Monitor::init_in`] and never touch the allocator if it is never
///     entered.</li>
/// <li>Ownership is tracked per OS thread. Threads that are not attached to
///     the subsystem can use monitors too, they are simply invisible to
///     thread dumps and cannot be interrupted.</li>
/// </ul>
pub struct Monitor {
    native: AtomicPtr<NativeMonitor>,
    owner: AtomicU64,
    entry_count: AtomicU32,
    waiters: AtomicU32,
    contention_count: AtomicU32,
    /// An interrupt could not wake a waiter because another thread owned the
    /// monitor. The next release of the native mutex broadcasts.
    escape_pending: AtomicBool,
    destroyed: AtomicBool,
}

/// Snapshot of a monitor for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct MonitorInfo {
    pub owner: Option<Arc<Thread>>,
    pub entry_count: u32,
    /// Attached threads blocked entering the monitor.
    pub entrants: Vec<Arc<Thread>>,
    /// Attached threads waiting for a notification.
    pub waiters: Vec<Arc<Thread>>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub const fn new() -> Self {
        Self {
            native: AtomicPtr::new(null_mut()),
            owner: AtomicU64::new(0),
            entry_count: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            contention_count: AtomicU32::new(0),
            escape_pending: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Initialize a monitor in place.
    pub fn init_in(storage: &mut MaybeUninit<Monitor>) -> &mut Monitor {
        storage.write(Self::new())
    }

    pub fn id(&self) -> MonitorId {
        MonitorId(self as *const Self as usize)
    }

    fn native(&self) -> Result<&NativeMonitor> {
        let ptr = self.native.load(Ordering::Acquire);
        if !ptr.is_null() {
            return Ok(unsafe { &*ptr });
        }
        self.allocate_native()
    }

    #[cold]
    fn allocate_native(&self) -> Result<&NativeMonitor> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(HpiError::MonitorDestroyed);
        }
        let _init = NATIVE_INIT_LOCK.lock();
        let ptr = self.native.load(Ordering::Acquire);
        if !ptr.is_null() {
            return Ok(unsafe { &*ptr });
        }

        let raw = unsafe { std::alloc::alloc(Layout::new::<NativeMonitor>()) }.cast::<NativeMonitor>();
        if raw.is_null() {
            return Err(HpiError::NoResource);
        }
        unsafe {
            raw.write(NativeMonitor {
                mutex: Mutex::new(WaitQueue::new()),
                cvar: Condvar::new(),
            });
        }
        self.native.store(raw, Ordering::Release);
        Ok(unsafe { &*raw })
    }

    /// # Safety
    ///
    /// The calling thread must own the monitor, which implies the native half
    /// is allocated.
    unsafe fn owned_native(&self) -> &NativeMonitor {
        let ptr = self.native.load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr }
    }

    fn check_owner(&self) -> Result<OwnerKey> {
        let me = OwnerKey::current();
        if self.owner.load(Ordering::Relaxed) != me.as_u64() {
            return Err(HpiError::NotOwner);
        }
        Ok(me)
    }

    pub fn enter(&self) -> Result<()> {
        let me = OwnerKey::current();
        if self.owner.load(Ordering::Relaxed) == me.as_u64() {
            let count = self.entry_count.load(Ordering::Relaxed);
            let count = count.checked_add(1).ok_or(HpiError::RecursionOverflow)?;
            self.entry_count.store(count, Ordering::Relaxed);
            return Ok(());
        }

        let native = self.native()?;
        let thread = try_current_thread();
        let guard = match native.mutex.try_lock() {
            Some(guard) => guard,
            None => self.enter_contended(native, thread),
        };
        // the mutex stays locked until the matching exit
        std::mem::forget(guard);
        self.owner.store(me.as_u64(), Ordering::SeqCst);
        self.entry_count.store(1, Ordering::Relaxed);
        if let Some(thread) = thread {
            thread.note_monitor_acquired();
        }
        Ok(())
    }

    #[cold]
    fn enter_contended<'a>(
        &'a self,
        native: &'a NativeMonitor,
        thread: Option<&Thread>,
    ) -> MutexGuard<'a, WaitQueue> {
        self.contention_count.fetch_add(1, Ordering::Relaxed);
        if let Some(thread) = thread {
            thread.set_blocked_entering(Some(self.id()));
        }
        let hooks = Hpi::profiling_hooks();
        if let Some(host) = hooks {
            host.monitor_contended_enter(thread, self);
        }

        let guard = native.mutex.lock();

        if let Some(thread) = thread {
            thread.set_blocked_entering(None);
        }
        self.contention_count.fetch_sub(1, Ordering::Relaxed);
        if let Some(host) = hooks {
            host.monitor_contended_entered(thread, self);
        }
        guard
    }

    pub fn exit(&self) -> Result<()> {
        self.check_owner()?;
        let count = self.entry_count.load(Ordering::Relaxed);
        debug_assert!(count > 0);
        if count > 1 {
            self.entry_count.store(count - 1, Ordering::Relaxed);
            return Ok(());
        }

        let native = unsafe { self.owned_native() };
        let thread = try_current_thread();
        self.entry_count.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::SeqCst);
        if let Some(thread) = thread {
            thread.note_monitor_released();
        }
        self.release_escapes(native);
        let contended = self.contention_count.load(Ordering::Relaxed) > 0;
        unsafe {
            native.mutex.force_unlock();
        }

        if contended {
            if let Some(host) = Hpi::profiling_hooks() {
                host.monitor_contended_exit(thread, self);
            }
        }
        Ok(())
    }

    /// Must be called with the native mutex held, right after the owner was
    /// cleared.
    fn release_escapes(&self, native: &NativeMonitor) {
        if self.escape_pending.swap(false, Ordering::SeqCst) {
            native.cvar.notify_all();
        }
    }

    /// Release the monitor completely and wait for a notification.
    ///
    /// Returns `Err(Timeout)` once a finite timeout has elapsed and
    /// `Err(Interrupted)` if the thread is interrupted before or during the
    /// wait. In every case the monitor is owned again, with the original
    /// entry count, when this returns. The interrupt flag is left set.
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        let me = self.check_owner()?;
        let deadline = timeout.deadline()?;
        let thread = try_current_thread();
        if thread.is_some_and(|thread| thread.interrupts().is_set()) {
            return Err(HpiError::Interrupted);
        }

        let native = unsafe { self.owned_native() };
        let mut guard = unsafe { native.mutex.make_guard_unchecked() };

        let saved = self.entry_count.swap(0, Ordering::Relaxed);
        if let Some(thread) = thread {
            thread.begin_monitor_wait(self.id(), saved);
        }
        self.owner.store(0, Ordering::SeqCst);
        self.release_escapes(native);

        let record = pin!(WaiterRecord::new(me, thread.map(|thread| thread.id())));
        let record = record.into_ref();
        unsafe {
            guard.push_back(record);
        }
        self.waiters.fetch_add(1, Ordering::Relaxed);

        let outcome = condvar::timed_wait(
            thread,
            &mut guard,
            &native.cvar,
            self,
            deadline,
            true,
            |_| record.is_notified(),
        );

        unsafe {
            guard.remove(record.get_ref());
        }
        self.waiters.fetch_sub(1, Ordering::Relaxed);
        if outcome == WaitOutcome::Interrupted && record.is_notified() {
            // pass the notification on instead of swallowing it
            if guard.notify_one() {
                native.cvar.notify_all();
            }
        }

        let saved = match thread {
            Some(thread) => {
                let saved = thread.end_monitor_wait();
                thread.leave_condvar_wait(&mut guard);
                saved
            }
            None => saved,
        };

        self.owner.store(me.as_u64(), Ordering::SeqCst);
        self.entry_count.store(saved, Ordering::Relaxed);
        std::mem::forget(guard);
        outcome.into_result()
    }

    /// Wake one waiter. A no-op if nobody waits.
    pub fn notify(&self) -> Result<()> {
        self.check_owner()?;
        let native = unsafe { self.owned_native() };
        let mut queue = ManuallyDrop::new(unsafe { native.mutex.make_guard_unchecked() });
        if queue.notify_one() {
            // every waiter shares the condvar; only the marked one leaves its loop
            native.cvar.notify_all();
        }
        Ok(())
    }

    /// Wake every thread waiting at the time of the call.
    pub fn notify_all(&self) -> Result<()> {
        self.check_owner()?;
        let native = unsafe { self.owned_native() };
        let mut queue = ManuallyDrop::new(unsafe { native.mutex.make_guard_unchecked() });
        if queue.notify_all() > 0 {
            native.cvar.notify_all();
        }
        Ok(())
    }

    pub fn owner(&self) -> Option<OwnerKey> {
        OwnerKey::from_raw(self.owner.load(Ordering::Relaxed))
    }

    /// The attached thread owning the monitor, if any.
    pub fn owner_thread(&self) -> Option<Arc<Thread>> {
        let owner = self.owner()?;
        Hpi::try_get()?.registry().find_by_owner_key(owner)
    }

    /// Whether the calling thread owns the monitor.
    pub fn is_entered(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == OwnerKey::current().as_u64()
    }

    pub fn entry_count(&self) -> u32 {
        if self.owner.load(Ordering::Relaxed) == 0 {
            0
        } else {
            self.entry_count.load(Ordering::Relaxed)
        }
    }

    pub fn waiter_count(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }

    pub fn contention_count(&self) -> u32 {
        self.contention_count.load(Ordering::Relaxed)
    }

    pub fn in_use(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
            || self.waiters.load(Ordering::Relaxed) != 0
            || self.contention_count.load(Ordering::Relaxed) != 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Best-effort snapshot. Entrants and waiters are only found among
    /// attached threads.
    pub fn info(&self) -> MonitorInfo {
        let mut info = MonitorInfo {
            owner: None,
            entry_count: self.entry_count(),
            entrants: Vec::new(),
            waiters: Vec::new(),
        };
        let Some(hpi) = Hpi::try_get() else {
            return info;
        };
        let id = self.id();
        let owner = self.owner();
        for thread in hpi.registry().threads().unwrap_or_default() {
            if owner.is_some() && thread.owner_key() == owner {
                info.owner = Some(thread.clone());
            }
            if thread.blocked_entering() == Some(id) {
                info.entrants.push(thread);
            } else if thread.waiting_on() == Some(id) {
                info.waiters.push(thread);
            }
        }
        info
    }

    /// Free the native half. Fails while the monitor is owned, waited on or
    /// contended.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            debug_assert!(false, "monitor {:?} destroyed twice", self.id());
            return Ok(());
        }
        if self.in_use() {
            self.destroyed.store(false, Ordering::Release);
            return Err(HpiError::MonitorInUse);
        }
        self.free_native();
        Ok(())
    }

    fn free_native(&self) {
        let ptr = self.native.swap(null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            unsafe {
                ptr.drop_in_place();
                std::alloc::dealloc(ptr.cast(), Layout::new::<NativeMonitor>());
            }
        }
    }

    /// Enter the monitor for the lifetime of the returned guard.
    pub fn lock(&self) -> Result<MonitorGuard<'_>> {
        self.enter()?;
        Ok(MonitorGuard {
            monitor: self,
            _not_send: PhantomData,
        })
    }

    pub fn synchronized<R>(&self, f: impl FnOnce(&MonitorGuard<'_>) -> R) -> Result<R> {
        let guard = self.lock()?;
        Ok(f(&guard))
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        debug_assert!(!self.in_use(), "monitor dropped while in use");
        self.free_native();
    }
}

/// Wakes an interrupted waiter. Runs on the interrupting thread.
impl Escape for Monitor {
    fn try_escape(&self) -> bool {
        let ptr = self.native.load(Ordering::Acquire);
        if ptr.is_null() {
            return true;
        }
        let native = unsafe { &*ptr };
        if self.is_entered() {
            native.cvar.notify_all();
            return true;
        }
        if let Some(_guard) = native.mutex.try_lock() {
            native.cvar.notify_all();
            return true;
        }
        // Somebody holds the mutex. An owner broadcasts when it releases the
        // monitor; if there is no owner the holder is transient, so retry.
        self.escape_pending.store(true, Ordering::SeqCst);
        self.owner.load(Ordering::SeqCst) != 0
    }
}

/// RAII ownership of a [`Monitor`]. Exits the monitor once on drop.
pub struct MonitorGuard<'a> {
    monitor: &'a Monitor,
    _not_send: PhantomData<*const ()>,
}

impl<'a> MonitorGuard<'a> {
    pub fn monitor(&self) -> &'a Monitor {
        self.monitor
    }

    pub fn wait(&self) -> Result<()> {
        self.monitor.wait(Timeout::Forever)
    }

    pub fn wait_timeout(&self, timeout: impl Into<Timeout>) -> Result<()> {
        self.monitor.wait(timeout.into())
    }

    pub fn notify(&self) {
        let _ = self.monitor.notify();
    }

    pub fn notify_all(&self) {
        let _ = self.monitor.notify_all();
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.monitor.exit() {
            log::error!("monitor guard failed to exit {:?}: {err}", self.monitor.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn native_half_is_lazy() {
        let monitor = Monitor::new();
        assert!(monitor.native.load(Ordering::Relaxed).is_null());
        monitor.destroy().unwrap();

        let monitor = Monitor::new();
        monitor.enter().unwrap();
        assert!(!monitor.native.load(Ordering::Relaxed).is_null());
        monitor.exit().unwrap();
        monitor.destroy().unwrap();
        assert!(monitor.native.load(Ordering::Relaxed).is_null());
    }

    #[test]
    fn init_in_place() {
        let mut storage = MaybeUninit::uninit();
        let monitor = Monitor::init_in(&mut storage);
        monitor.enter().unwrap();
        assert!(monitor.is_entered());
        monitor.exit().unwrap();
        assert!(!monitor.in_use());
        monitor.destroy().unwrap();
        unsafe { storage.assume_init_drop() };
    }

    #[test]
    fn destroy_refuses_owned_monitor() {
        let monitor = Monitor::new();
        monitor.enter().unwrap();
        assert_eq!(monitor.destroy(), Err(HpiError::MonitorInUse));
        monitor.exit().unwrap();
        assert_eq!(monitor.destroy(), Ok(()));
        assert_eq!(monitor.enter(), Err(HpiError::MonitorDestroyed));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "destroyed twice"))]
    fn double_destroy() {
        let monitor = Monitor::new();
        monitor.destroy().unwrap();
        monitor.destroy().unwrap();
    }

    #[test]
    fn guard_pairs_enter_and_exit() {
        let monitor = Monitor::new();
        {
            let outer = monitor.lock().unwrap();
            let _inner = monitor.lock().unwrap();
            assert_eq!(outer.monitor().entry_count(), 2);
        }
        assert_eq!(monitor.entry_count(), 0);
        assert!(monitor.owner().is_none());
        assert_eq!(monitor.synchronized(|guard| guard.monitor().entry_count()), Ok(1));
    }

    #[test]
    fn unattached_wait_times_out() {
        let monitor = Monitor::new();
        let guard = monitor.lock().unwrap();
        assert_eq!(
            guard.wait_timeout(Duration::from_millis(10)),
            Err(HpiError::Timeout)
        );
        assert_eq!(monitor.entry_count(), 1);
    }
}
