use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::SocksProxy;

/// Dispatcher and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts after which a queued message is hard failed.
    #[serde(default = "defaults::maximum_delivery_attempts")]
    pub default_maximum_delivery_attempts: u32,

    /// Claim other ready messages sharing a batch key and send them over the
    /// same connection.
    #[serde(default = "defaults::enabled")]
    pub batch_queued_messages: bool,

    /// Prepend `Resent-Sender` carrying the envelope sender to outbound mail.
    #[serde(default = "defaults::enabled")]
    pub use_resent_sender_header: bool,

    /// Locks older than this are considered abandoned and released.
    #[serde(default = "defaults::lock_stale_days")]
    pub queued_message_lock_stale_days: u32,

    /// Webhook requests older than this are pruned.
    #[serde(default = "defaults::webhook_request_retention_days")]
    pub webhook_request_retention_days: u32,

    /// Smart hosts used for all outbound SMTP instead of MX lookups,
    /// e.g. `smtp://relay.example.com:587?ssl_mode=STARTTLS`.
    #[serde(default)]
    pub smtp_relays: Vec<String>,

    /// The platform's SMTP hostname, used in trace headers and as the last
    /// resort HELO name.
    #[serde(default)]
    pub smtp_hostname: Option<String>,

    /// Proxy for SMTP connections from egress addresses without their own.
    #[serde(default)]
    pub socks_proxy: Option<SocksProxy>,
}

impl DeliveryConfig {
    #[must_use]
    pub const fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.queued_message_lock_stale_days as u64 * 86_400)
    }

    #[must_use]
    pub const fn webhook_retention(&self) -> Duration {
        Duration::from_secs(self.webhook_request_retention_days as u64 * 86_400)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            default_maximum_delivery_attempts: defaults::maximum_delivery_attempts(),
            batch_queued_messages: defaults::enabled(),
            use_resent_sender_header: defaults::enabled(),
            queued_message_lock_stale_days: defaults::lock_stale_days(),
            webhook_request_retention_days: defaults::webhook_request_retention_days(),
            smtp_relays: Vec::new(),
            smtp_hostname: None,
            socks_proxy: None,
        }
    }
}

mod defaults {
    pub const fn maximum_delivery_attempts() -> u32 {
        18
    }

    pub const fn enabled() -> bool {
        true
    }

    pub const fn lock_stale_days() -> u32 {
        1
    }

    pub const fn webhook_request_retention_days() -> u32 {
        7
    }
}
