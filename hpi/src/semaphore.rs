use std::cell::UnsafeCell;

/// Counting semaphore over POSIX `sem_t`.
///
/// `post` is async-signal-safe, which is what the suspend handler relies on to
/// acknowledge a rendezvous.
pub struct Semaphore {
    platform_sema: UnsafeCell<libc::sem_t>,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new(initial_value: u32) -> Self {
        let mut sema = std::mem::MaybeUninit::uninit();
        unsafe {
            if libc::sem_init(sema.as_mut_ptr(), 0, initial_value) != 0 {
                crate::fatal!("sem_init failed: {}", errno::errno());
            }
        }

        Self {
            platform_sema: UnsafeCell::new(unsafe { sema.assume_init() }),
        }
    }

    /// Block until the count is positive and decrement it. Retries when a
    /// signal interrupts the wait.
    pub fn wait(&self) {
        loop {
            unsafe {
                if libc::sem_wait(self.platform_sema.get()) == 0 {
                    return;
                }
            }
            let err = errno::errno();
            if err.0 != libc::EINTR {
                crate::fatal!("sem_wait failed: {}", err);
            }
        }
    }

    pub fn try_wait(&self) -> bool {
        unsafe { libc::sem_trywait(self.platform_sema.get()) == 0 }
    }

    pub fn post(&self) {
        unsafe {
            if libc::sem_post(self.platform_sema.get()) != 0 {
                crate::fatal!("sem_post failed: {}", errno::errno());
            }
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.platform_sema.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn post_then_wait() {
        let sema = Semaphore::new(0);
        assert!(!sema.try_wait());
        sema.post();
        sema.post();
        sema.wait();
        assert!(sema.try_wait());
        assert!(!sema.try_wait());
    }

    #[test]
    fn wakes_other_thread() {
        let sema = Arc::new(Semaphore::new(0));
        let other = sema.clone();
        let handle = std::thread::spawn(move || other.wait());
        sema.post();
        handle.join().unwrap();
    }
}
