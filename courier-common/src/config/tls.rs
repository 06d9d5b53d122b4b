//! SSL policy for outbound SMTP connections.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How TLS is negotiated with a remote SMTP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SslMode {
    /// Upgrade with STARTTLS when offered, without verifying the certificate.
    ///
    /// A failed handshake is retried once in plaintext.
    #[default]
    Auto,

    /// Require STARTTLS and verify the certificate chain.
    #[serde(alias = "STARTTLS", alias = "starttls")]
    StartTls,

    /// Connect with implicit TLS and verify the certificate chain.
    #[serde(alias = "TLS", alias = "tls")]
    Tls,

    /// Never encrypt.
    None,
}

impl SslMode {
    /// Whether the certificate chain must validate against the system roots.
    #[must_use]
    pub const fn verifies_certificates(self) -> bool {
        matches!(self, Self::StartTls | Self::Tls)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown SSL mode: {0}")]
pub struct ParseSslModeError(String);

impl FromStr for SslMode {
    type Err = ParseSslModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "starttls" => Ok(Self::StartTls),
            "tls" => Ok(Self::Tls),
            "none" => Ok(Self::None),
            _ => Err(ParseSslModeError(s.to_string())),
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "Auto",
            Self::StartTls => "STARTTLS",
            Self::Tls => "TLS",
            Self::None => "None",
        })
    }
}
