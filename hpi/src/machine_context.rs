//! Register state of a parked thread.
//!
//! The collector scans registers conservatively, so their layout is not
//! interpreted: a snapshot is simply the first [`REGISTER_WORDS`] machine
//! words of the platform register block.

/// Number of machine words recorded per thread.
pub const REGISTER_WORDS: usize = 32;

cfgenius::cond! {

    if macro(crate::macros::darwin) {
        cfgenius::cond! {
            if cfg(target_arch="x86_64") {
                pub type PlatformRegisters = libc::__darwin_x86_thread_state64;
            } else if cfg(target_arch="aarch64") {
                pub type PlatformRegisters = libc::__darwin_arm_thread_state64;
            } else {
                compile_error!("Unsupported Apple target");
            }
        }

        pub unsafe fn registers_from_ucontext(ucontext: *const libc::ucontext_t) -> *const PlatformRegisters {
            return unsafe { &(*(*ucontext).uc_mcontext).__ss };
        }

    } else if macro(crate::macros::have_machine_context) {

        #[cfg(not(target_os="openbsd"))]
        use libc::mcontext_t;
        #[cfg(target_os="openbsd")]
        use libc::ucontext_t as mcontext_t;

        #[repr(C)]
        #[derive(Clone)]
        pub struct PlatformRegisters {
            pub machine_context: mcontext_t
        }

        pub unsafe fn registers_from_ucontext(ucontext: *const libc::ucontext_t) -> *const PlatformRegisters {
            cfgenius::cond! {
                if cfg(target_os="openbsd")
                {
                    return ucontext.cast();
                } else {
                    return unsafe { std::ptr::addr_of!((*ucontext).uc_mcontext).cast() };
                }
            }
        }

    } else {
        #[repr(C)]
        pub struct PlatformRegisters {
            pub stack_pointer: *mut u8
        }

        pub unsafe fn registers_from_ucontext(_ucontext: *const libc::ucontext_t) -> *const PlatformRegisters {
            std::ptr::null()
        }
    }
}

/// Fixed vector of machine words captured while a thread is parked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub words: [usize; REGISTER_WORDS],
    pub len: usize,
}

impl Default for RegisterSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl RegisterSnapshot {
    pub const fn empty() -> Self {
        Self {
            words: [0; REGISTER_WORDS],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.words[..self.len]
    }

    /// Copy the register block saved by the kernel on signal delivery.
    ///
    /// # Safety
    ///
    /// `ucontext` must be the third argument of an `SA_SIGINFO` handler
    /// currently executing on this thread.
    pub unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Self {
        let mut snapshot = Self::empty();
        if ucontext.is_null() {
            return snapshot;
        }
        let registers = unsafe { registers_from_ucontext(ucontext) };
        if registers.is_null() {
            return snapshot;
        }
        let available = size_of::<PlatformRegisters>() / size_of::<usize>();
        snapshot.len = available.min(REGISTER_WORDS);
        let words = registers.cast::<usize>();
        for i in 0..snapshot.len {
            snapshot.words[i] = unsafe { words.add(i).read_unaligned() };
        }
        snapshot
    }

    /// Spill the callee-saved registers of the calling thread. Caller-saved
    /// registers are already on the stack at any call site.
    #[inline(never)]
    pub fn capture() -> Self {
        let mut snapshot = Self::empty();
        let base = snapshot.words.as_mut_ptr();
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                unsafe {
                    std::arch::asm!(
                        "mov [{0}], rbx",
                        "mov [{0} + 8], rbp",
                        "mov [{0} + 16], r12",
                        "mov [{0} + 24], r13",
                        "mov [{0} + 32], r14",
                        "mov [{0} + 40], r15",
                        in(reg) base,
                        options(nostack, preserves_flags),
                    );
                }
                snapshot.len = 6;
            } else if #[cfg(target_arch = "aarch64")] {
                unsafe {
                    std::arch::asm!(
                        "stp x19, x20, [{0}]",
                        "stp x21, x22, [{0}, #16]",
                        "stp x23, x24, [{0}, #32]",
                        "stp x25, x26, [{0}, #48]",
                        "stp x27, x28, [{0}, #64]",
                        "stp x29, x30, [{0}, #80]",
                        in(reg) base,
                        options(nostack, preserves_flags),
                    );
                }
                snapshot.len = 12;
            } else {
                let _ = base;
            }
        }
        snapshot
    }
}
