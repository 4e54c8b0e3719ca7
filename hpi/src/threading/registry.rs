use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use super::{OwnerKey, Thread, ThreadId};
use crate::{
    error::Result,
    sync::{Monitor, MonitorGuard},
};

/// All attached threads.
///
/// Guarded by a [`Monitor`] that works before any thread is attached, so the
/// registry can be built and used during bootstrap.
pub struct ThreadRegistry {
    lock: Monitor,
    inner: RefCell<RegistryInner>,
    count: AtomicUsize,
}

struct RegistryInner {
    threads: Vec<Option<Arc<Thread>>>,
    free_thread_indices: Vec<usize>,
}

// `inner` is only touched with `lock` entered.
unsafe impl Sync for ThreadRegistry {}
unsafe impl Send for ThreadRegistry {}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub const fn new() -> Self {
        Self {
            lock: Monitor::new(),
            inner: RefCell::new(RegistryInner {
                threads: Vec::new(),
                free_thread_indices: Vec::new(),
            }),
            count: AtomicUsize::new(0),
        }
    }

    /// Enter the registry lock. It is recursive, so visitors may call back
    /// into the registry.
    pub fn lock(&self) -> Result<MonitorGuard<'_>> {
        self.lock.lock()
    }

    pub fn is_locked_by_current(&self) -> bool {
        self.lock.is_entered()
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn register(&self, thread: Arc<Thread>) -> Result<()> {
        let _guard = self.lock()?;
        self.insert(thread);
        Ok(())
    }

    /// Register the first thread of the process without locking.
    pub(crate) fn register_primordial(&self, thread: Arc<Thread>) {
        // nothing else can see the registry yet
        {
            let inner = self.inner.borrow();
            assert!(inner.threads.is_empty());
            assert!(inner.free_thread_indices.is_empty());
        }
        self.insert(thread);
    }

    fn insert(&self, thread: Arc<Thread>) {
        let mut inner = self.inner.borrow_mut();
        let idx = inner
            .free_thread_indices
            .pop()
            .unwrap_or(inner.threads.len());
        thread.index_in_registry.store(idx, Ordering::Relaxed);
        if idx >= inner.threads.len() {
            inner.threads.push(Some(thread));
        } else {
            inner.threads[idx] = Some(thread);
        }
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unregister(&self, thread: &Thread) -> Result<()> {
        let _guard = self.lock()?;
        let mut inner = self.inner.borrow_mut();
        let idx = thread.index_in_registry.load(Ordering::Relaxed);
        let registered = inner
            .threads
            .get(idx)
            .and_then(Option::as_ref)
            .is_some_and(|slot| std::ptr::eq(Arc::as_ptr(slot), thread));
        if registered {
            inner.threads[idx] = None;
            inner.free_thread_indices.push(idx);
            thread.index_in_registry.store(usize::MAX, Ordering::Relaxed);
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Visit every registered thread. The caller must hold the registry lock.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<Thread>)) {
        assert!(
            self.lock.is_entered(),
            "registry walked without holding its lock"
        );
        let inner = self.inner.borrow();
        for thread in inner.threads.iter().flatten() {
            visitor(thread);
        }
    }

    pub fn threads(&self) -> Result<Vec<Arc<Thread>>> {
        let _guard = self.lock()?;
        let mut threads = Vec::with_capacity(self.len());
        self.for_each(|thread| threads.push(thread.clone()));
        Ok(threads)
    }

    pub fn find(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.find_by(|thread| thread.id() == id)
    }

    pub fn find_by_owner_key(&self, key: OwnerKey) -> Option<Arc<Thread>> {
        self.find_by(|thread| thread.owner_key() == Some(key))
    }

    fn find_by(&self, predicate: impl Fn(&Thread) -> bool) -> Option<Arc<Thread>> {
        let _guard = self.lock().ok()?;
        let inner = self.inner.borrow();
        inner
            .threads
            .iter()
            .flatten()
            .find(|thread| predicate(thread))
            .cloned()
    }
}
