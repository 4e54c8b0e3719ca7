cfgenius::define! {
    pub darwin = cfg(target_vendor="apple");
    pub have_machine_context = any(
        macro(darwin),
        cfg(target_os="fuchsia"),
        all(
            cfg(any(
                target_os="freebsd",
                target_os="haiku",
                target_os="netbsd",
                target_os="openbsd",
                target_os="linux",
                target_os="hurd"
            )),
            cfg(
                any(
                    target_arch="x86_64",
                    target_arch="arm",
                    target_arch="aarch64",
                    target_arch="riscv64",
                )
            )
        ));

}

/// Report an unrecoverable failure of the platform layer to the host.
///
/// Goes through [`HostRuntime::fatal`](crate::HostRuntime::fatal) once the
/// subsystem is bootstrapped and panics before that.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal_error(format_args!($($arg)*))
    };
}
