use thiserror::Error;

/// Status codes reported across the entry-point table.
///
/// The numeric values are part of the host ABI and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Err = -1,
    Interrupted = -2,
    Timeout = -3,
    NoMem = -5,
    NoResource = -6,
}

/// Errors returned by monitor, thread and suspension operations.
///
/// Misuse by the caller (exiting a monitor it does not own, waiting with a
/// bad timeout, resuming the world twice) is reported here and never aborts
/// the process. Each variant maps onto one of the [`Status`] codes, see
/// [`HpiError::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HpiError {
    #[error("current thread does not own the monitor")]
    NotOwner,
    #[error("timeout must be positive, got {0}ms")]
    InvalidTimeout(i64),
    #[error("monitor is still owned or waited on")]
    MonitorInUse,
    #[error("monitor has been destroyed")]
    MonitorDestroyed,
    #[error("recursion count of the monitor overflowed")]
    RecursionOverflow,
    #[error("thread was interrupted")]
    Interrupted,
    #[error("wait timed out")]
    Timeout,
    #[error("out of memory")]
    NoMemory,
    #[error("failed to allocate a platform resource")]
    NoResource,
    #[error("current thread is not attached")]
    NotAttached,
    #[error("thread is already attached")]
    AlreadyAttached,
    #[error("thread is not alive")]
    ThreadNotAlive,
    #[error("thread still owns {0} monitor(s)")]
    OwnsMonitors(u32),
    #[error("suspend count overflowed")]
    SuspendOverflow,
    #[error("world is already stopped")]
    WorldAlreadyStopped,
    #[error("world is not stopped")]
    WorldNotStopped,
    #[error("thread set did not become stable after {0} rounds")]
    UnstableThreadSet(usize),
    #[error("thread subsystem is already bootstrapped")]
    AlreadyBootstrapped,
    #[error("thread subsystem is not bootstrapped")]
    NotBootstrapped,
    #[error("thread subsystem has been shut down")]
    ShutDown,
    #[error("{0} thread(s) still alive")]
    ThreadsAlive(usize),
    #[error("signal operation failed: {0}")]
    Signal(errno::Errno),
    #[error("failed to spawn native thread")]
    Spawn,
}

impl HpiError {
    pub fn status(&self) -> Status {
        match self {
            Self::Interrupted => Status::Interrupted,
            Self::Timeout => Status::Timeout,
            Self::NoMemory => Status::NoMem,
            Self::NoResource => Status::NoResource,
            _ => Status::Err,
        }
    }
}

impl From<HpiError> for Status {
    fn from(err: HpiError) -> Self {
        err.status()
    }
}

impl<T> From<Result<T, HpiError>> for Status {
    fn from(result: Result<T, HpiError>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(err) => err.status(),
        }
    }
}

pub type Result<T, E = HpiError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_maps_to_generic_error() {
        assert_eq!(HpiError::NotOwner.status(), Status::Err);
        assert_eq!(HpiError::InvalidTimeout(0).status(), Status::Err);
        assert_eq!(HpiError::WorldNotStopped.status(), Status::Err);
    }

    #[test]
    fn resource_errors_stay_distinct() {
        assert_eq!(HpiError::NoResource.status(), Status::NoResource);
        assert_eq!(HpiError::NoMemory.status(), Status::NoMem);
        assert_ne!(Status::NoResource, Status::Err);
    }

    #[test]
    fn result_conversion() {
        let ok: Result<u32> = Ok(3);
        assert_eq!(Status::from(ok), Status::Ok);
        let timed_out: Result<()> = Err(HpiError::Timeout);
        assert_eq!(Status::from(timed_out), Status::Timeout);
        assert_eq!(Status::Interrupted as i32, -2);
    }
}
