use clap::Parser;

/// Environment variable holding whitespace separated options, e.g.
/// `HPI_OPTIONS="--suspend-signal 12 --profile-monitors"`.
pub const OPTIONS_ENV: &str = "HPI_OPTIONS";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Signal used to rendezvous with a running thread that is being suspended.
    #[clap(long, default_value_t = libc::SIGUSR2)]
    pub suspend_signal: i32,

    /// Upper bound on enumeration rounds of `suspend_all` before the thread set
    /// is considered unstable.
    #[clap(long, default_value_t = 32)]
    pub max_suspend_rounds: usize,

    /// Invoke the host's contended-monitor hooks even if the host does not ask for them.
    #[clap(long, default_value_t = false)]
    pub profile_monitors: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self::parse_from(["hpi"])
    }
}

impl Options {
    /// Read options from [`OPTIONS_ENV`]. Malformed values are reported and
    /// replaced by defaults, the process arguments are never consulted.
    pub fn from_env() -> Self {
        match std::env::var(OPTIONS_ENV) {
            Ok(value) => Self::from_flags(&value),
            Err(_) => Self::default(),
        }
    }

    pub fn from_flags(flags: &str) -> Self {
        let args = std::iter::once("hpi").chain(flags.split_whitespace());
        match Self::try_parse_from(args) {
            Ok(options) => options,
            Err(err) => {
                log::warn!("ignoring malformed {OPTIONS_ENV}: {err}");
                Self::default()
            }
        }
    }
}
