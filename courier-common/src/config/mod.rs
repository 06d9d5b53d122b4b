//! Configuration shared between the delivery crates and the worker binary.
//!
//! Every field carries a serde default so that a partial (or empty) RON
//! document deserializes into a working configuration.
//!
//! - [`tls`]: SSL policy for outbound SMTP connections
//! - [`timeouts`]: SMTP client socket timeouts
//! - [`dns`]: resolver and signing identity settings
//! - [`database`]: queue database location and pool sizing
//! - [`delivery`]: dispatcher and retry policy settings
//! - [`proxy`]: SOCKS5 proxies for outbound SMTP

pub mod database;
pub mod delivery;
pub mod dns;
pub mod proxy;
pub mod timeouts;
pub mod tls;

pub use database::DatabaseConfig;
pub use delivery::DeliveryConfig;
pub use dns::DnsConfig;
pub use proxy::SocksProxy;
pub use timeouts::SmtpClientTimeouts;
pub use tls::{ParseSslModeError, SslMode};
