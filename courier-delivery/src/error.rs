//! Typed error handling for delivery operations.
//!
//! Per-attempt failures never surface here: senders fold them into a
//! [`SendResult`](crate::SendResult). What remains are faults of the
//! machinery itself:
//! - Queue storage failures
//! - Resolver construction and timeout errors
//! - DKIM key problems
//! - Failures reported by external collaborators

use thiserror::Error;

use crate::{DkimError, DnsError};

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The queue database failed.
    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    /// DNS lookup or resolver construction failed.
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// A signing key could not be loaded or used.
    #[error("DKIM error: {0}")]
    Dkim(#[from] DkimError),

    /// The message store or another collaborator reported a failure.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// Configuration that cannot be used as given.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl DeliveryError {
    /// Short, stable label for metrics and error reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Dns(DnsError::Timeout(_)) => "dns_timeout",
            Self::Dns(_) => "dns",
            Self::Dkim(_) => "dkim",
            Self::Collaborator(_) => "collaborator",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Errors from the sqlx-backed queue store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration v{version} failed: {source}")]
    Migration {
        version: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("Queued message {0} must be locked before batching")]
    NotLocked(i64),
}

pub type Result<T, E = DeliveryError> = std::result::Result<T, E>;
