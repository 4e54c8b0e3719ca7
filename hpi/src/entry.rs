//! C entry points of the thread subsystem.
//!
//! The host obtains the table with [`hpi_thread_interface`]. Threads are
//! passed around as `*const Thread`, monitors live in host-provided storage
//! of [`hpi_monitor_sizeof`] bytes. All functions report through [`Status`];
//! misuse is an error code, never a crash.
use std::{
    ffi::c_void,
    mem::MaybeUninit,
    sync::Arc,
};

use crate::{
    error::{HpiError, Status},
    options::Options,
    sync::{Monitor, Timeout},
    threading::{try_current_thread, Thread},
    DefaultHost, Hpi,
};

pub type ThreadStart = unsafe extern "C-unwind" fn(arg: *mut c_void);

/// Monitor snapshot for the host.
///
/// The host passes in `entrants` and `waiters` buffers with their capacities,
/// either may be null. They are filled with handles of the threads blocked
/// entering the monitor and of the threads waiting on it, up to capacity;
/// `entrant_count` and `waiter_count` report the totals. Handles are valid
/// while their thread stays attached.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawMonitorInfo {
    pub owner: *const Thread,
    pub entry_count: u32,
    pub entrant_count: u32,
    pub waiter_count: u32,
    pub entrants: *mut *const Thread,
    pub entrants_capacity: u32,
    pub waiters: *mut *const Thread,
    pub waiters_capacity: u32,
}

impl Default for RawMonitorInfo {
    fn default() -> Self {
        Self {
            owner: std::ptr::null(),
            entry_count: 0,
            entrant_count: 0,
            waiter_count: 0,
            entrants: std::ptr::null_mut(),
            entrants_capacity: 0,
            waiters: std::ptr::null_mut(),
            waiters_capacity: 0,
        }
    }
}

/// Copy as many handles of `threads` as fit into `buffer`.
///
/// # Safety
///
/// `buffer` is null or valid for `capacity` writes.
unsafe fn fill_handles(buffer: *mut *const Thread, capacity: u32, threads: &[Arc<Thread>]) {
    if buffer.is_null() {
        return;
    }
    for (i, thread) in threads.iter().take(capacity as usize).enumerate() {
        unsafe { buffer.add(i).write(Arc::as_ptr(thread)) };
    }
}

#[repr(C)]
pub struct HpiThreadInterface {
    pub thread_bootstrap: unsafe extern "C-unwind" fn(out: *mut *const Thread) -> Status,
    pub thread_create: unsafe extern "C-unwind" fn(
        out: *mut *const Thread,
        stack_size: usize,
        start: ThreadStart,
        arg: *mut c_void,
    ) -> Status,
    pub thread_release: unsafe extern "C-unwind" fn(thread: *const Thread),
    pub thread_free: unsafe extern "C-unwind" fn() -> Status,
    pub thread_suspend: unsafe extern "C-unwind" fn(thread: *const Thread) -> Status,
    pub thread_resume: unsafe extern "C-unwind" fn(thread: *const Thread) -> Status,
    pub thread_yield: unsafe extern "C-unwind" fn(),
    pub thread_self: unsafe extern "C-unwind" fn() -> *const Thread,
    pub thread_sleep: unsafe extern "C-unwind" fn(millis: i64) -> Status,
    pub thread_set_priority: unsafe extern "C-unwind" fn(thread: *const Thread, priority: i32) -> Status,
    pub thread_interrupt: unsafe extern "C-unwind" fn(thread: *const Thread) -> Status,
    pub thread_is_interrupted: unsafe extern "C-unwind" fn(thread: *const Thread, clear: bool) -> bool,
    pub monitor_sizeof: unsafe extern "C-unwind" fn() -> usize,
    pub monitor_init: unsafe extern "C-unwind" fn(monitor: *mut Monitor) -> Status,
    pub monitor_destroy: unsafe extern "C-unwind" fn(monitor: *mut Monitor) -> Status,
    pub monitor_enter: unsafe extern "C-unwind" fn(monitor: *const Monitor) -> Status,
    pub monitor_exit: unsafe extern "C-unwind" fn(monitor: *const Monitor) -> Status,
    pub monitor_notify: unsafe extern "C-unwind" fn(monitor: *const Monitor) -> Status,
    pub monitor_notify_all: unsafe extern "C-unwind" fn(monitor: *const Monitor) -> Status,
    pub monitor_wait: unsafe extern "C-unwind" fn(monitor: *const Monitor, millis: i64) -> Status,
    pub monitor_entered: unsafe extern "C-unwind" fn(monitor: *const Monitor) -> bool,
    pub monitor_owner: unsafe extern "C-unwind" fn(monitor: *const Monitor) -> *const Thread,
    pub monitor_in_use: unsafe extern "C-unwind" fn(monitor: *const Monitor) -> bool,
    pub monitor_get_info:
        unsafe extern "C-unwind" fn(monitor: *const Monitor, info: *mut RawMonitorInfo) -> Status,
    pub suspend_all: unsafe extern "C-unwind" fn() -> Status,
    pub resume_all: unsafe extern "C-unwind" fn() -> Status,
}

struct StartArg(*mut c_void);

unsafe impl Send for StartArg {}

/// Bootstrap with options from `HPI_OPTIONS` and attach the calling thread
/// as the primordial thread.
pub unsafe extern "C-unwind" fn hpi_thread_bootstrap(out: *mut *const Thread) -> Status {
    match Hpi::bootstrap_primordial(DefaultHost, Options::from_env()) {
        Ok((_, guard)) => {
            let thread: *const Thread = Arc::as_ptr(guard.thread());
            // detached again by `hpi_thread_free`
            std::mem::forget(guard);
            if let Some(out) = unsafe { out.as_mut() } {
                *out = thread;
            }
            Status::Ok
        }
        Err(err) => err.status(),
    }
}

/// Create a suspended thread running `start(arg)`. The handle stored in
/// `out` owns a reference; give it back with `hpi_thread_release`.
pub unsafe extern "C-unwind" fn hpi_thread_create(
    out: *mut *const Thread,
    stack_size: usize,
    start: ThreadStart,
    arg: *mut c_void,
) -> Status {
    let arg = StartArg(arg);
    let mut builder = Thread::builder();
    if stack_size != 0 {
        builder = builder.stack_size(stack_size);
    }
    let created = builder.create(move || {
        let arg = arg;
        unsafe { start(arg.0) }
    });
    match created {
        Ok(thread) => {
            let thread = Arc::into_raw(thread);
            match unsafe { out.as_mut() } {
                Some(out) => *out = thread,
                None => drop(unsafe { Arc::from_raw(thread) }),
            }
            Status::Ok
        }
        Err(err) => err.status(),
    }
}

pub unsafe extern "C-unwind" fn hpi_thread_release(thread: *const Thread) {
    if !thread.is_null() {
        drop(unsafe { Arc::from_raw(thread) });
    }
}

/// Detach the calling thread.
pub unsafe extern "C-unwind" fn hpi_thread_free() -> Status {
    Thread::detach_current().into()
}

fn with_thread(thread: *const Thread, f: impl FnOnce(&Hpi, &Thread) -> Result<(), HpiError>) -> Status {
    let Some(hpi) = Hpi::try_get() else {
        return Status::Err;
    };
    match unsafe { thread.as_ref() } {
        Some(thread) => f(hpi, thread).into(),
        None => Status::Err,
    }
}

pub unsafe extern "C-unwind" fn hpi_thread_suspend(thread: *const Thread) -> Status {
    with_thread(thread, |hpi, thread| hpi.suspend(thread))
}

pub unsafe extern "C-unwind" fn hpi_thread_resume(thread: *const Thread) -> Status {
    with_thread(thread, |hpi, thread| hpi.resume(thread))
}

pub unsafe extern "C-unwind" fn hpi_thread_yield() {
    Thread::yield_now();
}

pub unsafe extern "C-unwind" fn hpi_thread_self() -> *const Thread {
    try_current_thread().map_or(std::ptr::null(), |thread| thread as *const Thread)
}

pub unsafe extern "C-unwind" fn hpi_thread_sleep(millis: i64) -> Status {
    Thread::sleep(millis, true).into()
}

pub unsafe extern "C-unwind" fn hpi_thread_set_priority(thread: *const Thread, priority: i32) -> Status {
    with_thread(thread, |_, thread| {
        thread.set_priority(priority);
        Ok(())
    })
}

pub unsafe extern "C-unwind" fn hpi_thread_interrupt(thread: *const Thread) -> Status {
    with_thread(thread, |_, thread| {
        thread.interrupt();
        Ok(())
    })
}

pub unsafe extern "C-unwind" fn hpi_thread_is_interrupted(thread: *const Thread, clear: bool) -> bool {
    unsafe { thread.as_ref() }.is_some_and(|thread| thread.is_interrupted(clear))
}

pub unsafe extern "C-unwind" fn hpi_monitor_sizeof() -> usize {
    size_of::<Monitor>()
}

pub unsafe extern "C-unwind" fn hpi_monitor_init(monitor: *mut Monitor) -> Status {
    match unsafe { monitor.cast::<MaybeUninit<Monitor>>().as_mut() } {
        Some(storage) => {
            Monitor::init_in(storage);
            Status::Ok
        }
        None => Status::Err,
    }
}

pub unsafe extern "C-unwind" fn hpi_monitor_destroy(monitor: *mut Monitor) -> Status {
    match unsafe { monitor.as_ref() } {
        Some(monitor) => monitor.destroy().into(),
        None => Status::Err,
    }
}

macro_rules! monitor_entry_points {
    ($($op:ident),*) => {
        paste::paste! {
            $(
                #[doc = "`Monitor::" $op "` for the host."]
                pub unsafe extern "C-unwind" fn [<hpi_monitor_ $op>](monitor: *const Monitor) -> Status {
                    match unsafe { monitor.as_ref() } {
                        Some(monitor) => monitor.$op().into(),
                        None => Status::Err,
                    }
                }
            )*
        }
    };
}

monitor_entry_points!(enter, exit, notify, notify_all);

/// Wait on `monitor` for `millis` milliseconds, or without a bound for
/// [`WAIT_FOREVER`](crate::sync::WAIT_FOREVER).
pub unsafe extern "C-unwind" fn hpi_monitor_wait(monitor: *const Monitor, millis: i64) -> Status {
    match unsafe { monitor.as_ref() } {
        Some(monitor) => monitor.wait(Timeout::from_millis(millis)).into(),
        None => Status::Err,
    }
}

pub unsafe extern "C-unwind" fn hpi_monitor_entered(monitor: *const Monitor) -> bool {
    unsafe { monitor.as_ref() }.is_some_and(Monitor::is_entered)
}

/// Owner of `monitor` if it is an attached thread. The pointer is borrowed
/// from the registry.
pub unsafe extern "C-unwind" fn hpi_monitor_owner(monitor: *const Monitor) -> *const Thread {
    unsafe { monitor.as_ref() }
        .and_then(Monitor::owner_thread)
        .map_or(std::ptr::null(), |thread| Arc::as_ptr(&thread))
}

pub unsafe extern "C-unwind" fn hpi_monitor_in_use(monitor: *const Monitor) -> bool {
    unsafe { monitor.as_ref() }.is_some_and(Monitor::in_use)
}

pub unsafe extern "C-unwind" fn hpi_monitor_get_info(
    monitor: *const Monitor,
    info: *mut RawMonitorInfo,
) -> Status {
    let (Some(monitor), Some(out)) = (unsafe { monitor.as_ref() }, unsafe { info.as_mut() }) else {
        return Status::Err;
    };
    let info = monitor.info();
    unsafe {
        fill_handles(out.entrants, out.entrants_capacity, &info.entrants);
        fill_handles(out.waiters, out.waiters_capacity, &info.waiters);
    }
    out.owner = info.owner.as_ref().map_or(std::ptr::null(), Arc::as_ptr);
    out.entry_count = info.entry_count;
    out.entrant_count = info.entrants.len() as u32;
    // unattached waiters are counted but have no handle
    out.waiter_count = monitor.waiter_count().max(info.waiters.len() as u32);
    Status::Ok
}

pub unsafe extern "C-unwind" fn hpi_suspend_all() -> Status {
    match Hpi::try_get() {
        Some(hpi) => hpi.suspend_all().into(),
        None => Status::Err,
    }
}

pub unsafe extern "C-unwind" fn hpi_resume_all() -> Status {
    match Hpi::try_get() {
        Some(hpi) => hpi.resume_all().into(),
        None => Status::Err,
    }
}

static INTERFACE: HpiThreadInterface = HpiThreadInterface {
    thread_bootstrap: hpi_thread_bootstrap,
    thread_create: hpi_thread_create,
    thread_release: hpi_thread_release,
    thread_free: hpi_thread_free,
    thread_suspend: hpi_thread_suspend,
    thread_resume: hpi_thread_resume,
    thread_yield: hpi_thread_yield,
    thread_self: hpi_thread_self,
    thread_sleep: hpi_thread_sleep,
    thread_set_priority: hpi_thread_set_priority,
    thread_interrupt: hpi_thread_interrupt,
    thread_is_interrupted: hpi_thread_is_interrupted,
    monitor_sizeof: hpi_monitor_sizeof,
    monitor_init: hpi_monitor_init,
    monitor_destroy: hpi_monitor_destroy,
    monitor_enter: hpi_monitor_enter,
    monitor_exit: hpi_monitor_exit,
    monitor_notify: hpi_monitor_notify,
    monitor_notify_all: hpi_monitor_notify_all,
    monitor_wait: hpi_monitor_wait,
    monitor_entered: hpi_monitor_entered,
    monitor_owner: hpi_monitor_owner,
    monitor_in_use: hpi_monitor_in_use,
    monitor_get_info: hpi_monitor_get_info,
    suspend_all: hpi_suspend_all,
    resume_all: hpi_resume_all,
};

#[no_mangle]
pub extern "C" fn hpi_thread_interface() -> &'static HpiThreadInterface {
    &INTERFACE
}
