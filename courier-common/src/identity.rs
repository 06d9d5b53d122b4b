//! Identity strings used to mark ownership of queue rows and worker roles.

use std::fmt::{self, Display};

use rand::Rng;

/// The stable identity of this worker process.
///
/// Claim tokens and role holders are derived from it. Two processes on the
/// same host differ by pid; two threads in one process differ by thread name,
/// and two claims on one thread differ by a random suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    hostname: String,
    pid: u32,
}

impl ProcessIdentity {
    /// Captures the identity of the running process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            pid: std::process::id(),
        }
    }

    #[must_use]
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
        }
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The identity qualified with a thread name.
    #[must_use]
    pub fn for_thread(&self, thread: &str) -> String {
        format!("{self} thread:{thread}")
    }

    /// A token unique to a single claim made from `thread`.
    #[must_use]
    pub fn claim_token(&self, thread: &str) -> String {
        let suffix: u64 = rand::rng().random();
        format!("{} {suffix:016x}", self.for_thread(thread))
    }
}

impl Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host:{} pid:{}", self.hostname, self.pid)
    }
}
