use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Resolver settings and the platform's own mail identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Primary lookup timeout. Retries use half of it.
    ///
    /// Default: 5 seconds
    #[serde(default = "defaults::timeout_secs", alias = "timeout")]
    pub timeout_secs: u64,

    /// Host resolver configuration used by the local resolver.
    #[serde(default = "defaults::resolv_conf_path")]
    pub resolv_conf_path: PathBuf,

    /// Domain used for envelope senders (and default DKIM signatures) when a
    /// sending domain has no verified return path of its own.
    #[serde(default = "defaults::return_path_domain")]
    pub return_path_domain: String,

    /// Label prepended to a sending domain to form its custom return path.
    #[serde(default = "defaults::custom_return_path_prefix")]
    pub custom_return_path_prefix: String,

    /// Name announced in EHLO when the egress address has no reverse DNS.
    #[serde(default)]
    pub helo_hostname: Option<String>,

    /// DKIM selector for platform-signed mail.
    #[serde(default = "defaults::dkim_identifier")]
    pub dkim_identifier: String,

    /// PEM encoded RSA key for platform-signed mail.
    #[serde(default)]
    pub dkim_private_key_path: Option<PathBuf>,
}

impl DnsConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::timeout_secs(),
            resolv_conf_path: defaults::resolv_conf_path(),
            return_path_domain: defaults::return_path_domain(),
            custom_return_path_prefix: defaults::custom_return_path_prefix(),
            helo_hostname: None,
            dkim_identifier: defaults::dkim_identifier(),
            dkim_private_key_path: None,
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub const fn timeout_secs() -> u64 {
        5
    }

    pub fn resolv_conf_path() -> PathBuf {
        PathBuf::from("/etc/resolv.conf")
    }

    pub fn return_path_domain() -> String {
        "rp.courier.example.com".to_string()
    }

    pub fn custom_return_path_prefix() -> String {
        "psrp".to_string()
    }

    pub fn dkim_identifier() -> String {
        "courier".to_string()
    }
}
