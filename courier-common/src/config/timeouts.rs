use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Socket timeouts for outbound SMTP sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpClientTimeouts {
    /// Time allowed to open the TCP connection (and complete an implicit TLS handshake).
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::open_timeout_secs", alias = "open_timeout")]
    pub open_timeout_secs: u64,

    /// Time allowed for any single read from the peer.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::read_timeout_secs", alias = "read_timeout")]
    pub read_timeout_secs: u64,
}

impl SmtpClientTimeouts {
    #[must_use]
    pub const fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            open_timeout_secs: defaults::open_timeout_secs(),
            read_timeout_secs: defaults::read_timeout_secs(),
        }
    }
}

mod defaults {
    pub const fn open_timeout_secs() -> u64 {
        30
    }

    pub const fn read_timeout_secs() -> u64 {
        30
    }
}
