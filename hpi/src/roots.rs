//! GC roots recorded for suspended threads.
use std::{collections::HashSet, ops::Range};

use crate::{
    machine_context::RegisterSnapshot, stack_bounds::current_stack_pointer, threading::ThreadId,
};

/// Stack pointer and register words of a parked thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootSnapshot {
    pub stack_pointer: usize,
    pub registers: RegisterSnapshot,
}

impl RootSnapshot {
    /// Snapshot of the calling thread. Everything its callers keep in
    /// registers or on the stack lies at or above the recorded stack pointer.
    #[inline(never)]
    pub fn capture() -> Self {
        let registers = RegisterSnapshot::capture();
        Self {
            stack_pointer: current_stack_pointer(),
            registers,
        }
    }
}

/// Roots of one suspended thread, as returned by `suspend_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRoots {
    pub thread: ThreadId,
    pub stack_pointer: usize,
    /// Highest address of the thread's stack.
    pub stack_origin: usize,
    pub registers: RegisterSnapshot,
}

impl ThreadRoots {
    /// Live part of the stack.
    pub fn stack_range(&self) -> Range<usize> {
        self.stack_pointer.min(self.stack_origin)..self.stack_origin
    }
}

/// Conservative root set: every word found in a span that the filter accepts
/// as a potential heap pointer.
pub struct ConservativeRoots {
    pub roots: HashSet<usize>,
    filter: Box<dyn Fn(usize) -> bool>,
}

impl ConservativeRoots {
    pub fn new(filter: impl Fn(usize) -> bool + 'static) -> Self {
        Self {
            roots: HashSet::new(),
            filter: Box::new(filter),
        }
    }

    /// Like [`new`](Self::new), with room for `capacity` roots so that adding
    /// them does not allocate.
    pub fn with_capacity(capacity: usize, filter: impl Fn(usize) -> bool + 'static) -> Self {
        Self {
            roots: HashSet::with_capacity(capacity),
            filter: Box::new(filter),
        }
    }

    /// Accept words inside `heap`.
    pub fn in_range(heap: Range<usize>) -> Self {
        Self::new(move |pointer| heap.contains(&pointer))
    }

    /// Add a pointer to conservative root set.
    ///
    /// If the filter rejects the pointer, this function does nothing.
    pub fn add_pointer(&mut self, pointer: usize) {
        if pointer == 0 || !(self.filter)(pointer) {
            return;
        }
        self.roots.insert(pointer);
    }

    /// Add all pointers in the span to the roots.
    ///
    /// # SAFETY
    ///
    /// Every word between `start` and `end` must be readable.
    pub unsafe fn add_span(&mut self, mut start: usize, mut end: usize) {
        if start > end {
            std::mem::swap(&mut start, &mut end);
        }
        let word = size_of::<usize>();
        let mut current = start.next_multiple_of(word);
        while current + word <= end {
            let value = unsafe { (current as *const usize).read_volatile() };
            self.add_pointer(value);
            current += word;
        }
    }

    /// Add the registers and the live stack of a suspended thread.
    ///
    /// # SAFETY
    ///
    /// The thread must stay suspended while this runs.
    pub unsafe fn add_thread(&mut self, thread: &ThreadRoots) {
        for &word in thread.registers.as_slice() {
            self.add_pointer(word);
        }
        let range = thread.stack_range();
        unsafe { self.add_span(range.start, range.end) };
    }

    pub fn contains(&self, pointer: usize) -> bool {
        self.roots.contains(&pointer)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_applies() {
        let mut roots = ConservativeRoots::in_range(0x1000..0x2000);
        roots.add_pointer(0x1800);
        roots.add_pointer(0x3000);
        roots.add_pointer(0);
        assert!(roots.contains(0x1800));
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn span_is_scanned_word_by_word() {
        let words: [usize; 4] = [0x1010, 7, 0x1fff, 0x1010];
        let mut roots = ConservativeRoots::in_range(0x1000..0x2000);
        let start = words.as_ptr() as usize;
        let end = start + size_of_val(&words);
        unsafe { roots.add_span(end, start) };
        assert_eq!(roots.len(), 2);
        assert!(roots.contains(0x1fff));
    }

    #[test]
    fn captured_stack_pointer_is_on_this_stack() {
        let snapshot = RootSnapshot::capture();
        let bounds = crate::stack_bounds::StackBounds::current_thread_stack_bounds();
        assert!(bounds.contains(snapshot.stack_pointer));
    }
}
