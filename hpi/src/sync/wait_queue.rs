use std::{cell::Cell, marker::PhantomPinned, pin::Pin, ptr::NonNull};

use crate::threading::{OwnerKey, ThreadId};

/// A thread parked in [`Monitor::wait`](super::Monitor::wait).
///
/// Records live on the waiting thread's stack and are linked into the
/// monitor's [`WaitQueue`] only for the duration of the wait call. All fields
/// are accessed with the monitor's native mutex held.
pub struct WaiterRecord {
    owner: OwnerKey,
    thread: Option<ThreadId>,
    notified: Cell<bool>,
    linked: Cell<bool>,
    prev: Cell<Option<NonNull<WaiterRecord>>>,
    next: Cell<Option<NonNull<WaiterRecord>>>,
    _pin: PhantomPinned,
}

impl WaiterRecord {
    pub fn new(owner: OwnerKey, thread: Option<ThreadId>) -> Self {
        Self {
            owner,
            thread,
            notified: Cell::new(false),
            linked: Cell::new(false),
            prev: Cell::new(None),
            next: Cell::new(None),
            _pin: PhantomPinned,
        }
    }

    pub fn owner(&self) -> OwnerKey {
        self.owner
    }

    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub fn is_notified(&self) -> bool {
        self.notified.get()
    }

    pub fn is_linked(&self) -> bool {
        self.linked.get()
    }
}

impl Drop for WaiterRecord {
    fn drop(&mut self) {
        debug_assert!(!self.linked.get(), "waiter record dropped while queued");
    }
}

/// Intrusive FIFO of [`WaiterRecord`]s.
pub struct WaitQueue {
    head: Option<NonNull<WaiterRecord>>,
    tail: Option<NonNull<WaiterRecord>>,
    len: usize,
}

// Records are only touched under the mutex that owns the queue.
unsafe impl Send for WaitQueue {}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `record` to the queue.
    ///
    /// # Safety
    ///
    /// `record` must stay pinned and be unlinked (via [`remove`](Self::remove)
    /// or one of the notify methods) before it is dropped.
    pub unsafe fn push_back(&mut self, record: Pin<&WaiterRecord>) {
        let record = record.get_ref();
        debug_assert!(!record.linked.get());
        let ptr = NonNull::from(record);
        record.prev.set(self.tail);
        record.next.set(None);
        match self.tail {
            Some(tail) => unsafe { tail.as_ref().next.set(Some(ptr)) },
            None => self.head = Some(ptr),
        }
        self.tail = Some(ptr);
        record.linked.set(true);
        self.len += 1;
    }

    /// Unlink `record`. Returns `false` if it was not queued.
    ///
    /// # Safety
    ///
    /// If `record` is linked it must be linked into this queue.
    pub unsafe fn remove(&mut self, record: &WaiterRecord) -> bool {
        if !record.linked.get() {
            return false;
        }
        let prev = record.prev.get();
        let next = record.next.get();
        match prev {
            Some(prev) => unsafe { prev.as_ref().next.set(next) },
            None => self.head = next,
        }
        match next {
            Some(next) => unsafe { next.as_ref().prev.set(prev) },
            None => self.tail = prev,
        }
        record.prev.set(None);
        record.next.set(None);
        record.linked.set(false);
        self.len -= 1;
        true
    }

    fn pop_front(&mut self) -> Option<&WaiterRecord> {
        let head = self.head?;
        // SAFETY: linked records are alive until they unlink themselves,
        // which requires the same `&mut self`.
        let record = unsafe { head.as_ref() };
        unsafe {
            self.remove(record);
        }
        Some(record)
    }

    /// Unlink the oldest waiter and mark it notified.
    pub fn notify_one(&mut self) -> bool {
        match self.pop_front() {
            Some(record) => {
                record.notified.set(true);
                true
            }
            None => false,
        }
    }

    /// Unlink and mark every queued waiter. Returns how many were woken.
    pub fn notify_all(&mut self) -> usize {
        let mut woken = 0;
        while self.notify_one() {
            woken += 1;
        }
        woken
    }

    pub fn iter(&self) -> impl Iterator<Item = &WaiterRecord> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let current = cursor?;
            let record = unsafe { current.as_ref() };
            cursor = record.next.get();
            Some(record)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::pin::pin;

    use super::*;

    fn key() -> OwnerKey {
        OwnerKey::current()
    }

    #[test]
    fn fifo_notification() {
        let mut queue = WaitQueue::new();
        let a = pin!(WaiterRecord::new(key(), None));
        let b = pin!(WaiterRecord::new(key(), None));
        let (a, b) = (a.into_ref(), b.into_ref());
        unsafe {
            queue.push_back(a);
            queue.push_back(b);
        }
        assert_eq!(queue.len(), 2);

        assert!(queue.notify_one());
        assert!(a.is_notified());
        assert!(!a.is_linked());
        assert!(!b.is_notified());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.notify_all(), 1);
        assert!(b.is_notified());
        assert!(queue.is_empty());
        assert!(!queue.notify_one());
    }

    #[test]
    fn remove_from_the_middle() {
        let mut queue = WaitQueue::new();
        let a = pin!(WaiterRecord::new(key(), None));
        let b = pin!(WaiterRecord::new(key(), None));
        let c = pin!(WaiterRecord::new(key(), None));
        let (a, b, c) = (a.into_ref(), b.into_ref(), c.into_ref());
        unsafe {
            queue.push_back(a);
            queue.push_back(b);
            queue.push_back(c);
            assert!(queue.remove(b.get_ref()));
            assert!(!queue.remove(b.get_ref()));
        }
        let order: Vec<*const WaiterRecord> = queue.iter().map(|r| r as *const _).collect();
        assert_eq!(order, vec![a.get_ref() as *const _, c.get_ref() as *const _]);

        unsafe {
            queue.remove(c.get_ref());
            queue.remove(a.get_ref());
        }
        assert!(queue.is_empty());
        assert_eq!(queue.iter().count(), 0);
    }
}
