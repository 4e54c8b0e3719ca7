use std::{
    cell::Cell,
    fmt,
    marker::PhantomData,
    num::NonZeroU64,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    thread::JoinHandle,
    time::Duration,
};

use atomic::Atomic;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    error::{HpiError, Result},
    roots::ThreadRoots,
    stack_bounds::StackBounds,
    sync::{
        condvar::{self, Timeout},
        MonitorId,
    },
    Hpi,
};

pub mod interrupt;
pub mod registry;
pub mod suspend;

use interrupt::{Escape, InterruptChannel};
use suspend::Suspension;

pub const MIN_PRIORITY: i32 = 1;
pub const NORM_PRIORITY: i32 = 5;
pub const MAX_PRIORITY: i32 = 10;

/// Coarse state of a thread, as seen by the suspension machinery and by
/// thread dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadState {
    /// Running, or blocked in code the substrate knows nothing about.
    #[default]
    Runnable,
    /// Parked by [`suspend`](suspend::SuspendController::suspend), either in
    /// the rendezvous signal handler or at a poll point.
    Suspended,
    /// Blocked in an interruptible condvar wait: `Monitor::wait` or
    /// [`Thread::sleep`]. A suspend request only marks such a thread, it
    /// parks itself once the wait ends.
    CondvarWait,
    /// Blocked entering a contended monitor. Derived from
    /// [`Thread::blocked_entering`], never stored.
    MonitorWait,
}

unsafe impl bytemuck::NoUninit for ThreadState {}

/// Identity of an OS thread for monitor ownership.
///
/// Derived from the address of a thread-local, so it exists for every OS
/// thread, attached or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerKey(NonZeroU64);

impl OwnerKey {
    pub fn current() -> Self {
        thread_local! {
            static KEY: u8 = const { 0 };
        }
        KEY.with(|x| {
            Self(
                NonZeroU64::new(x as *const _ as u64)
                    .expect("thread-local variable address is null"),
            )
        })
    }

    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    fn next() -> Self {
        static ID: AtomicU64 = AtomicU64::new(1);
        let id = ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Parker used by [`Thread::sleep`].
struct Sleeper {
    lock: Mutex<()>,
    cvar: Condvar,
}

impl Escape for Sleeper {
    fn try_escape(&self) -> bool {
        match self.lock.try_lock() {
            Some(_guard) => {
                self.cvar.notify_all();
                true
            }
            None => false,
        }
    }
}

/// Per-thread record of the substrate.
///
/// Most fields are only written by the thread itself. Suspension state is
/// written by other threads while holding the thread's suspend lock, and the
/// monitor bookkeeping (`blocked_entering`, `waiting_on`,
/// `saved_entry_count`) is written by the thread while it holds, or is about
/// to acquire, the monitor's native mutex.
pub struct Thread {
    id: ThreadId,
    name: Option<String>,
    native: AtomicUsize,
    owner_key: AtomicU64,
    stack_bounds: OnceLock<StackBounds>,
    state: Atomic<ThreadState>,
    priority: AtomicI32,
    pub(crate) suspension: Suspension,
    interrupts: InterruptChannel,
    sleeper: Sleeper,
    blocked_entering: AtomicUsize,
    waiting_on: AtomicUsize,
    saved_entry_count: AtomicU32,
    monitors_owned: AtomicU32,
    pub(crate) index_in_registry: AtomicUsize,
    about_to_terminate: AtomicBool,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Thread {
    pub(crate) fn new(name: Option<String>, priority: i32) -> Self {
        Self {
            id: ThreadId::next(),
            name,
            native: AtomicUsize::new(0),
            owner_key: AtomicU64::new(0),
            stack_bounds: OnceLock::new(),
            state: Atomic::new(ThreadState::Runnable),
            priority: AtomicI32::new(priority.clamp(MIN_PRIORITY, MAX_PRIORITY)),
            suspension: Suspension::new(),
            interrupts: InterruptChannel::new(),
            sleeper: Sleeper {
                lock: Mutex::new(()),
                cvar: Condvar::new(),
            },
            blocked_entering: AtomicUsize::new(0),
            waiting_on: AtomicUsize::new(0),
            saved_entry_count: AtomicU32::new(0),
            monitors_owned: AtomicU32::new(0),
            index_in_registry: AtomicUsize::new(usize::MAX),
            about_to_terminate: AtomicBool::new(false),
            join_handle: Mutex::new(None),
        }
    }

    pub fn builder() -> ThreadBuilder {
        ThreadBuilder::default()
    }

    pub fn current() -> &'static Thread {
        current_thread()
    }

    pub fn try_current() -> Option<&'static Thread> {
        try_current_thread()
    }

    /// Attach the calling OS thread. The returned guard detaches it again.
    pub fn attach_current(name: Option<&str>) -> Result<AttachGuard> {
        let hpi = Hpi::try_get().ok_or(HpiError::NotBootstrapped)?;
        hpi.check_live()?;
        if try_current_thread().is_some() {
            return Err(HpiError::AlreadyAttached);
        }
        let thread = Arc::new(Thread::new(name.map(String::from), NORM_PRIORITY));
        thread.bind_current();
        if let Err(err) = hpi.registry().register(thread.clone()) {
            deinit_current_thread();
            return Err(err);
        }
        log::debug!("attached thread {thread}");
        Ok(AttachGuard::new(thread))
    }

    /// Detach the calling thread. Refused while it still owns monitors.
    pub fn detach_current() -> Result<()> {
        let thread = try_current_thread().ok_or(HpiError::NotAttached)?;
        let owned = thread.monitors_owned();
        if owned > 0 {
            return Err(HpiError::OwnsMonitors(owned));
        }
        thread.terminate();
        Ok(())
    }

    /// Bind `self` to the calling OS thread.
    pub(crate) fn bind_current(self: &Arc<Self>) {
        self.native
            .store(unsafe { libc::pthread_self() } as usize, Ordering::Relaxed);
        self.owner_key
            .store(OwnerKey::current().as_u64(), Ordering::Relaxed);
        let _ = self
            .stack_bounds
            .set(StackBounds::current_thread_stack_bounds());
        init_current_thread(self.clone());
    }

    fn startoff<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(),
    {
        self.bind_current();
        self.park_initial();
        if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            log::warn!("thread {self} terminated by a panic");
        }
        self.terminate();
    }

    fn terminate(&self) {
        self.poll();
        self.mark_about_to_terminate();
        let owned = self.monitors_owned();
        if owned > 0 {
            log::error!("thread {self} terminates while owning {owned} monitor(s)");
        }
        if let Some(hpi) = Hpi::try_get() {
            if let Err(err) = hpi.registry().unregister(self) {
                log::error!("failed to unregister thread {self}: {err}");
            }
        }
        log::debug!("thread {self} terminated");
        deinit_current_thread();
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn native_handle(&self) -> libc::pthread_t {
        self.native.load(Ordering::Relaxed) as libc::pthread_t
    }

    pub fn owner_key(&self) -> Option<OwnerKey> {
        OwnerKey::from_raw(self.owner_key.load(Ordering::Relaxed))
    }

    pub fn stack_bounds(&self) -> StackBounds {
        self.stack_bounds
            .get()
            .copied()
            .unwrap_or(StackBounds::empty_bounds())
    }

    pub fn is_current(&self) -> bool {
        try_current_thread().is_some_and(|current| current.id == self.id)
    }

    pub fn is_alive(&self) -> bool {
        !self.about_to_terminate.load(Ordering::Acquire)
    }

    pub fn is_about_to_terminate(&self) -> bool {
        self.about_to_terminate.load(Ordering::Acquire)
    }

    /// Current state. `MonitorWait` is reported while the thread is blocked
    /// entering a monitor.
    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            ThreadState::Runnable if self.blocked_entering().is_some() => ThreadState::MonitorWait,
            state => state,
        }
    }

    pub(crate) fn stored_state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state, Ordering::Release);
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Record an advisory priority, clamped to
    /// [`MIN_PRIORITY`]..=[`MAX_PRIORITY`]. It has no scheduling effect.
    pub fn set_priority(&self, priority: i32) {
        self.priority.store(
            priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            Ordering::Relaxed,
        );
    }

    pub fn interrupts(&self) -> &InterruptChannel {
        &self.interrupts
    }

    pub fn interrupt(&self) {
        log::trace!("interrupting thread {self}");
        self.interrupts.interrupt();
    }

    pub fn is_interrupted(&self, clear: bool) -> bool {
        self.interrupts.is_interrupted(clear)
    }

    pub fn blocked_entering(&self) -> Option<MonitorId> {
        MonitorId::from_raw(self.blocked_entering.load(Ordering::Acquire))
    }

    pub(crate) fn set_blocked_entering(&self, monitor: Option<MonitorId>) {
        self.blocked_entering
            .store(monitor.map_or(0, MonitorId::addr), Ordering::Release);
    }

    pub fn waiting_on(&self) -> Option<MonitorId> {
        MonitorId::from_raw(self.waiting_on.load(Ordering::Acquire))
    }

    pub(crate) fn begin_monitor_wait(&self, monitor: MonitorId, entry_count: u32) {
        self.saved_entry_count.store(entry_count, Ordering::Relaxed);
        self.waiting_on.store(monitor.addr(), Ordering::Release);
    }

    /// Returns the entry count saved by [`begin_monitor_wait`](Self::begin_monitor_wait).
    pub(crate) fn end_monitor_wait(&self) -> u32 {
        self.waiting_on.store(0, Ordering::Release);
        self.saved_entry_count.swap(0, Ordering::Relaxed)
    }

    pub fn monitors_owned(&self) -> u32 {
        self.monitors_owned.load(Ordering::Relaxed)
    }

    pub(crate) fn note_monitor_acquired(&self) {
        self.monitors_owned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_monitor_released(&self) {
        // monitors entered before the thread was attached were never counted
        let _ = self
            .monitors_owned
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn suspend_count(&self) -> u32 {
        self.suspension.count.get()
    }

    /// Roots recorded while the thread is suspended.
    pub fn roots(&self) -> Option<ThreadRoots> {
        let snapshot = self.suspension.snapshot()?;
        Some(ThreadRoots {
            thread: self.id,
            stack_pointer: snapshot.stack_pointer,
            stack_origin: self.stack_bounds().origin(),
            registers: snapshot.registers,
        })
    }

    /// Wait for a thread started with [`ThreadBuilder::create`] to finish.
    pub fn join(&self) -> Result<()> {
        if self.is_current() {
            return Err(HpiError::ThreadNotAlive);
        }
        let handle = self.join_handle.lock().take();
        if let Some(handle) = handle {
            // panics are caught in `startoff`
            let _ = handle.join();
        }
        Ok(())
    }

    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            suspend_count: self.suspend_count(),
            interrupted: self.interrupts.is_set(),
            priority: self.priority(),
            blocked_entering: self.blocked_entering(),
            waiting_on: self.waiting_on(),
            monitors_owned: self.monitors_owned(),
        }
    }

    /// Sleep for `millis` milliseconds. A non-positive duration only yields.
    ///
    /// An interruptible sleep returns `Err(Interrupted)` as soon as the thread
    /// is interrupted. Threads that are not attached sleep uninterruptibly.
    pub fn sleep(millis: i64, interruptible: bool) -> Result<()> {
        if millis <= 0 {
            Self::yield_now();
            return Ok(());
        }
        let Some(thread) = try_current_thread() else {
            std::thread::sleep(Duration::from_millis(millis as u64));
            return Ok(());
        };
        if interruptible && thread.interrupts.is_set() {
            return Err(HpiError::Interrupted);
        }

        let sleeper = &thread.sleeper;
        let mut guard = sleeper.lock.lock();
        let deadline = Timeout::Millis(millis).deadline()?;
        let outcome = condvar::timed_wait(
            Some(thread),
            &mut guard,
            &sleeper.cvar,
            sleeper,
            deadline,
            interruptible,
            |_| false,
        );
        thread.leave_condvar_wait(&mut guard);
        match outcome.into_result() {
            Err(HpiError::Timeout) => Ok(()),
            result => result,
        }
    }

    /// Poll point followed by an OS yield.
    pub fn yield_now() {
        if let Some(thread) = try_current_thread() {
            thread.poll();
        }
        std::thread::yield_now();
    }

    /// Leave the `CondvarWait` state entered by [`condvar::timed_wait`]. A
    /// suspension requested during the wait is honoured here, with the mutex
    /// behind `guard` temporarily released.
    pub(crate) fn leave_condvar_wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        if self.finish_condvar_wait() {
            MutexGuard::unlocked(guard, || self.poll());
        }
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}({name})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("suspend_count", &self.suspend_count())
            .finish_non_exhaustive()
    }
}

/// Row of a thread dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: Option<String>,
    pub state: ThreadState,
    pub suspend_count: u32,
    pub interrupted: bool,
    pub priority: i32,
    pub blocked_entering: Option<MonitorId>,
    pub waiting_on: Option<MonitorId>,
    pub monitors_owned: u32,
}

impl fmt::Display for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" {} prio={} {:?}",
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.id,
            self.priority,
            self.state
        )?;
        if self.suspend_count > 0 {
            write!(f, " suspended={}", self.suspend_count)?;
        }
        if self.interrupted {
            write!(f, " interrupted")?;
        }
        if let Some(monitor) = self.blocked_entering {
            write!(f, " entering={:#x}", monitor.addr())?;
        }
        if let Some(monitor) = self.waiting_on {
            write!(f, " waiting={:#x}", monitor.addr())?;
        }
        if self.monitors_owned > 0 {
            write!(f, " owns={}", self.monitors_owned)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ThreadBuilder {
    name: Option<String>,
    stack_size: Option<usize>,
    priority: Option<i32>,
}

impl ThreadBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Create a thread that is registered and parked before running `f`.
    ///
    /// The thread starts with a suspend count of one; the first
    /// [`resume`](suspend::SuspendController::resume) lets it run.
    pub fn create<F>(self, f: F) -> Result<Arc<Thread>>
    where
        F: FnOnce() + Send + 'static,
    {
        let hpi = Hpi::try_get().ok_or(HpiError::NotBootstrapped)?;
        hpi.check_live()?;

        let thread = Arc::new(Thread::new(
            self.name.clone(),
            self.priority.unwrap_or(NORM_PRIORITY),
        ));
        thread.suspension.count.set_initial(1);
        // Registered before it runs; the suspend count keeps stop-the-world
        // from signalling it until it is parked.
        hpi.registry().register(thread.clone())?;

        let mut builder = std::thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let this = thread.clone();
        let handle = match builder.spawn(move || this.startoff(f)) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("failed to spawn thread {thread}: {err}");
                let _ = hpi.registry().unregister(&thread);
                return Err(HpiError::Spawn);
            }
        };
        *thread.join_handle.lock() = Some(handle);
        thread.suspension.wait_for_ack();
        log::debug!("created thread {thread}");
        Ok(thread)
    }

    /// Create the thread and let it run at once.
    pub fn spawn<F>(self, f: F) -> Result<Arc<Thread>>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = self.create(f)?;
        Hpi::get().suspend_controller().resume(&thread)?;
        Ok(thread)
    }
}

/// Keeps the calling OS thread attached.
pub struct AttachGuard {
    thread: Arc<Thread>,
    detached: bool,
    _not_send: PhantomData<*const ()>,
}

impl AttachGuard {
    pub(crate) fn new(thread: Arc<Thread>) -> Self {
        Self {
            thread,
            detached: false,
            _not_send: PhantomData,
        }
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// Detach now, reporting `OwnsMonitors` instead of detaching anyway.
    pub fn detach(mut self) -> Result<()> {
        Thread::detach_current()?;
        self.detached = true;
        Ok(())
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let owned = self.thread.monitors_owned();
        if owned > 0 {
            log::error!(
                "thread {} detaches while owning {owned} monitor(s)",
                self.thread
            );
        }
        self.thread.terminate();
    }
}

thread_local! {
    static CURRENT_THREAD: Cell<*const Thread> = const { Cell::new(std::ptr::null()) };
}

pub fn current_thread() -> &'static Thread {
    match try_current_thread() {
        Some(thread) => thread,
        None => panic!("current thread is not attached"),
    }
}

/// The attached thread running this code. Async-signal-safe.
pub fn try_current_thread() -> Option<&'static Thread> {
    let ptr = CURRENT_THREAD.try_with(Cell::get).ok()?;
    // SAFETY: the TLS slot holds a strong reference until `deinit_current_thread`
    unsafe { ptr.as_ref() }
}

pub(crate) fn init_current_thread(thread: Arc<Thread>) {
    let thread = Arc::into_raw(thread);
    CURRENT_THREAD.with(|t| t.set(thread));
}

pub(crate) fn deinit_current_thread() {
    CURRENT_THREAD.with(|t| {
        let ptr = t.replace(std::ptr::null());
        if !ptr.is_null() {
            drop(unsafe { Arc::from_raw(ptr) });
        }
    })
}
