use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};

use threading::{
    registry::ThreadRegistry,
    suspend::{StopTheWorld, SuspendController},
    AttachGuard, ThreadInfo,
};

pub mod entry;
pub mod error;
pub mod machine_context;
pub mod macros;
pub mod options;
pub mod roots;
pub mod semaphore;
pub mod stack_bounds;
pub mod sync;
pub mod threading;

pub use error::{HpiError, Result, Status};
pub use options::Options;
pub use roots::{ConservativeRoots, ThreadRoots};
pub use sync::{Monitor, MonitorGuard, MonitorId, MonitorInfo, Timeout, WAIT_FOREVER};
pub use threading::{Thread, ThreadId, ThreadState};

/// Upcalls into the runtime embedding the thread subsystem.
pub trait HostRuntime: Send + Sync + 'static {
    /// Report an unrecoverable failure. Must not return.
    fn fatal(&self, message: &str) -> ! {
        log::error!("fatal error in thread subsystem: {message}");
        std::process::abort()
    }

    /// Whether the contended-monitor hooks below should be called.
    fn profiling_enabled(&self) -> bool {
        false
    }

    /// `thread` is about to block entering `monitor`.
    fn monitor_contended_enter(&self, thread: Option<&Thread>, monitor: &Monitor) {
        let _ = thread;
        let _ = monitor;
    }

    /// `thread` entered `monitor` after blocking.
    fn monitor_contended_entered(&self, thread: Option<&Thread>, monitor: &Monitor) {
        let _ = thread;
        let _ = monitor;
    }

    /// `thread` released `monitor` while other threads were blocked on it.
    fn monitor_contended_exit(&self, thread: Option<&Thread>, monitor: &Monitor) {
        let _ = thread;
        let _ = monitor;
    }
}

/// Host without hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHost;

impl HostRuntime for DefaultHost {}

/// The process-wide thread subsystem.
///
/// Owns the thread registry and the suspension machinery. Created once by
/// [`Hpi::bootstrap`], which installs the rendezvous signal handler, and shut
/// down by [`Hpi::teardown`].
pub struct Hpi {
    host: Box<dyn HostRuntime>,
    options: Options,
    registry: ThreadRegistry,
    suspend: SuspendController,
    profiling: bool,
    live: AtomicBool,
}

static HPI: OnceLock<Hpi> = OnceLock::new();

impl Hpi {
    pub fn bootstrap(host: impl HostRuntime, options: Options) -> Result<&'static Hpi> {
        if HPI.get().is_some() {
            return Err(HpiError::AlreadyBootstrapped);
        }
        let suspend = SuspendController::new(&options);
        suspend.install()?;
        let hpi = Hpi {
            profiling: options.profile_monitors || host.profiling_enabled(),
            host: Box::new(host),
            options,
            registry: ThreadRegistry::new(),
            suspend,
            live: AtomicBool::new(true),
        };
        HPI.set(hpi).map_err(|_| HpiError::AlreadyBootstrapped)?;
        let hpi = Self::get();
        log::debug!(
            "thread subsystem bootstrapped, suspend signal {}",
            hpi.options.suspend_signal
        );
        Ok(hpi)
    }

    /// Bootstrap and register the calling thread as the first thread of the
    /// process.
    pub fn bootstrap_primordial(
        host: impl HostRuntime,
        options: Options,
    ) -> Result<(&'static Hpi, AttachGuard)> {
        let hpi = Self::bootstrap(host, options)?;
        let thread = Arc::new(Thread::new(Some("main".to_string()), threading::NORM_PRIORITY));
        thread.bind_current();
        hpi.registry.register_primordial(thread.clone());
        Ok((hpi, AttachGuard::new(thread)))
    }

    /// Return the subsystem, bootstrapping it with `host` and options from
    /// the environment if nobody did yet.
    pub fn ensure_bootstrapped<H: HostRuntime>(host: impl FnOnce() -> H) -> Result<&'static Hpi> {
        if let Some(hpi) = HPI.get() {
            return Ok(hpi);
        }
        match Self::bootstrap(host(), Options::from_env()) {
            Err(HpiError::AlreadyBootstrapped) => Ok(Self::get()),
            result => result,
        }
    }

    /// # Panics
    ///
    /// Panics if the subsystem is not bootstrapped.
    pub fn get() -> &'static Hpi {
        HPI.get().expect("thread subsystem is not bootstrapped")
    }

    pub fn try_get() -> Option<&'static Hpi> {
        HPI.get()
    }

    pub(crate) fn profiling_hooks() -> Option<&'static dyn HostRuntime> {
        let hpi = HPI.get()?;
        hpi.profiling.then_some(&*hpi.host)
    }

    pub fn host(&self) -> &dyn HostRuntime {
        &*self.host
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn suspend_controller(&self) -> &SuspendController {
        &self.suspend
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(HpiError::ShutDown)
        }
    }

    pub fn suspend(&self, thread: &Thread) -> Result<()> {
        self.suspend.suspend(thread)
    }

    pub fn resume(&self, thread: &Thread) -> Result<()> {
        self.suspend.resume(thread)
    }

    pub fn suspend_all(&self) -> Result<Vec<ThreadRoots>> {
        self.suspend.suspend_all(&self.registry)
    }

    pub fn resume_all(&self) -> Result<()> {
        self.suspend.resume_all()
    }

    pub fn stop_the_world(&self) -> Result<StopTheWorld<'_>> {
        self.suspend.stop_the_world(&self.registry)
    }

    pub fn dump_threads(&self) -> Result<Vec<ThreadInfo>> {
        Ok(self
            .registry
            .threads()?
            .iter()
            .map(|thread| thread.info())
            .collect())
    }

    /// Shut the subsystem down. Fails while threads other than the caller
    /// are still registered. Afterwards no thread can be attached or created
    /// and the previous disposition of the suspend signal is restored.
    pub fn teardown(&self) -> Result<()> {
        let me = threading::try_current_thread().map(Thread::id);
        let guard = self.registry.lock()?;
        let mut alive = 0;
        self.registry.for_each(|thread| {
            if Some(thread.id()) != me && !thread.is_about_to_terminate() {
                alive += 1;
            }
        });
        if alive > 0 {
            return Err(HpiError::ThreadsAlive(alive));
        }
        if !self.live.swap(false, Ordering::AcqRel) {
            return Err(HpiError::ShutDown);
        }
        drop(guard);
        self.suspend.uninstall();
        log::debug!("thread subsystem shut down");
        Ok(())
    }
}

/// Backend of [`fatal!`].
#[cold]
pub fn fatal_error(args: fmt::Arguments<'_>) -> ! {
    match Hpi::try_get() {
        Some(hpi) => hpi.host().fatal(&args.to_string()),
        None => panic!("{args}"),
    }
}
