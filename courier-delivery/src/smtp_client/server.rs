use std::{fmt, net::IpAddr};

use courier_common::config::SslMode;
use url::Url;

use super::Endpoint;
use crate::{
    DeliveryError,
    dns::{DnsError, LookupOptions, Resolve},
};

pub const DEFAULT_SMTP_PORT: u16 = 25;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// A remote SMTP server by name, before address resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Server {
    hostname: String,
    port: u16,
    ssl_mode: SslMode,
    credentials: Option<Credentials>,
}

impl Server {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: DEFAULT_SMTP_PORT,
            ssl_mode: SslMode::Auto,
            credentials: None,
        }
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub const fn with_ssl_mode(mut self, ssl_mode: SslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Parses a relay given as `smtp://[user:pass@]host[:port][?ssl_mode=MODE]`.
    pub fn from_relay_url(relay: &str) -> Result<Self, DeliveryError> {
        let invalid = |reason: String| DeliveryError::Configuration(format!("SMTP relay {relay}: {reason}"));

        let url = Url::parse(relay).map_err(|err| invalid(err.to_string()))?;
        if url.scheme() != "smtp" {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }

        let hostname = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let hostname = hostname.trim_start_matches('[').trim_end_matches(']');

        let mut server = Self::new(hostname).with_port(url.port().unwrap_or(DEFAULT_SMTP_PORT));

        for (key, value) in url.query_pairs() {
            if key == "ssl_mode" {
                let ssl_mode = value.parse().map_err(|err| invalid(format!("{err}")))?;
                server = server.with_ssl_mode(ssl_mode);
            }
        }

        if !url.username().is_empty() {
            server = server.with_credentials(url.username(), url.password().unwrap_or_default());
        }

        Ok(server)
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Every address this server can be reached at, IPv6 first.
    ///
    /// A hostname that is already an IP literal yields that address alone.
    /// Lookup timeouts propagate.
    pub async fn endpoints(&self, resolver: &dyn Resolve) -> Result<Vec<Endpoint>, DnsError> {
        if let Ok(ip) = self.hostname.parse::<IpAddr>() {
            return Ok(vec![Endpoint::new(self.clone(), ip)]);
        }

        let options = LookupOptions::raising();
        let ipv6 = resolver.aaaa(&self.hostname, options).await?;
        let ipv4 = resolver.a(&self.hostname, options).await?;

        Ok(ipv6
            .into_iter()
            .map(IpAddr::V6)
            .chain(ipv4.into_iter().map(IpAddr::V4))
            .map(|ip| Endpoint::new(self.clone(), ip))
            .collect())
    }
}
