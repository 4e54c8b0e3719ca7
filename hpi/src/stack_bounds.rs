use std::ptr::null_mut;

/// Bounds of a native thread stack. `origin` is the highest address (stacks
/// grow downwards on every supported target), `bound` the lowest usable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackBounds {
    origin: usize,
    bound: usize,
}

impl StackBounds {
    pub const fn empty_bounds() -> Self {
        Self {
            origin: 0,
            bound: 0,
        }
    }

    pub fn current_thread_stack_bounds() -> Self {
        let result = unsafe { Self::new_thread_stack_bounds(libc::pthread_self()) };
        result.check_consistency();
        result
    }

    pub fn origin(&self) -> usize {
        debug_assert!(self.origin != 0);
        self.origin
    }

    pub fn end(&self) -> usize {
        debug_assert!(self.bound != 0);
        self.bound
    }

    pub fn size(&self) -> usize {
        self.origin - self.bound
    }

    pub fn is_empty(&self) -> bool {
        self.origin == 0
    }

    pub fn contains(&self, p: usize) -> bool {
        if self.is_empty() {
            return false;
        }
        self.origin >= p && p > self.bound
    }

    fn check_consistency(&self) {
        #[cfg(debug_assertions)]
        {
            let current_position = current_stack_pointer();
            assert_ne!(self.origin, self.bound);
            assert!(current_position < self.origin && current_position > self.bound);
        }
    }

    /// # Safety
    ///
    /// `handle` must name a live thread.
    pub unsafe fn new_thread_stack_bounds(handle: libc::pthread_t) -> Self {
        #[cfg(target_vendor = "apple")]
        unsafe {
            let origin = libc::pthread_get_stackaddr_np(handle);
            let size = libc::pthread_get_stacksize_np(handle);
            Self {
                origin: origin as usize,
                bound: origin as usize - size,
            }
        }

        #[cfg(target_os = "openbsd")]
        {
            let mut stack: std::mem::MaybeUninit<libc::stack_t> = std::mem::MaybeUninit::zeroed();
            unsafe {
                libc::pthread_stackseg_np(handle, stack.as_mut_ptr() as _);
            }
            let stack = unsafe { stack.assume_init() };
            let origin = stack.ss_sp as usize;
            Self {
                origin,
                bound: origin - stack.ss_size,
            }
        }

        #[cfg(all(unix, not(target_vendor = "apple"), not(target_os = "openbsd")))]
        {
            let mut bound = null_mut();
            let mut stack_size = 0;

            let mut sattr: std::mem::MaybeUninit<libc::pthread_attr_t> =
                std::mem::MaybeUninit::zeroed();

            unsafe {
                libc::pthread_attr_init(sattr.as_mut_ptr());
                #[cfg(target_os = "netbsd")]
                {
                    libc::pthread_attr_get_np(handle, sattr.as_mut_ptr());
                }
                #[cfg(not(target_os = "netbsd"))]
                {
                    libc::pthread_getattr_np(handle, sattr.as_mut_ptr());
                }
                libc::pthread_attr_getstack(sattr.as_ptr(), &mut bound, &mut stack_size);
                libc::pthread_attr_destroy(sattr.as_mut_ptr());
                let bound = bound as usize;
                Self {
                    origin: bound + stack_size,
                    bound,
                }
            }
        }
    }
}

#[inline(never)]
pub fn current_stack_pointer() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        let current_sp: usize;
        unsafe {
            std::arch::asm!(
                "mov {}, rsp",
                out(reg) current_sp,
                options(nomem, nostack, preserves_flags),
            );
        }
        current_sp
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let marker = 0usize;
        std::hint::black_box(&marker) as *const usize as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_stack_is_inside_bounds() {
        let bounds = StackBounds::current_thread_stack_bounds();
        assert!(!bounds.is_empty());
        assert!(bounds.size() > 0);
        assert!(bounds.contains(current_stack_pointer()));
    }

    #[test]
    fn empty_bounds_contain_nothing() {
        let bounds = StackBounds::empty_bounds();
        assert!(bounds.is_empty());
        assert!(!bounds.contains(current_stack_pointer()));
    }
}
