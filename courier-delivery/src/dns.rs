//! DNS resolution for delivery and domain checks.
//!
//! Every lookup runs under a three-tier timeout schedule: the configured
//! timeout, then two retries at half of it. Whether exhausting the schedule
//! is an error is up to the caller ([`LookupOptions`]). Missing records,
//! NXDOMAIN and other lookup failures all resolve to an empty answer.
//!
//! Names are converted to their ASCII (punycode) form before querying.

use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use async_trait::async_trait;
use courier_common::config::DnsConfig;
use hickory_resolver::{
    ResolveError, TokioResolver,
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::rr::{Name, RData, RecordType},
    system_conf::parse_resolv_conf,
};
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during DNS resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Every tier of the timeout schedule elapsed.
    #[error("DNS lookup for {0} timed out")]
    Timeout(String),

    /// The host resolver configuration is missing or unusable.
    #[error("DNS resolver configuration error: {0}")]
    Configuration(String),

    /// A domain-scoped resolver was requested but the domain's nameservers
    /// could not be resolved.
    #[error("No nameservers could be found for {0}")]
    NoNameservers(String),

    /// The name could not be turned into a query.
    #[error("DNS lookup failed: {0}")]
    Lookup(String),
}

impl DnsError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::NoNameservers(_))
    }
}

/// Per-call lookup behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupOptions {
    /// Return [`DnsError::Timeout`] instead of an empty answer when the
    /// timeout schedule is exhausted.
    pub raise_timeout_errors: bool,
}

impl LookupOptions {
    #[must_use]
    pub const fn raising() -> Self {
        Self {
            raise_timeout_errors: true,
        }
    }
}

/// A mail exchanger for a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    /// Lower values are preferred.
    pub preference: u16,
    pub exchange: String,
}

impl MxRecord {
    #[must_use]
    pub fn new(preference: u16, exchange: impl Into<String>) -> Self {
        Self {
            preference,
            exchange: exchange.into(),
        }
    }
}

/// The lookups senders need to find their next hop.
///
/// [`DnsResolver`] is the production implementation; tests substitute a
/// static table.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn a(&self, name: &str, options: LookupOptions) -> Result<Vec<Ipv4Addr>, DnsError>;

    async fn aaaa(&self, name: &str, options: LookupOptions) -> Result<Vec<Ipv6Addr>, DnsError>;

    /// MX records sorted by preference, with ties in random order.
    async fn mx(&self, name: &str, options: LookupOptions) -> Result<Vec<MxRecord>, DnsError>;

    /// The PTR name for `ip`, or `ip` itself when there is none.
    async fn ip_to_hostname(&self, ip: IpAddr, options: LookupOptions)
    -> Result<String, DnsError>;
}

/// Resolver with a timeout policy, optionally restricted to a fixed set of
/// nameservers.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    resolver: TokioResolver,
    timeout: Duration,
}

impl DnsResolver {
    /// Creates the host's default resolver from `config.resolv_conf_path`.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::Configuration`] if the file cannot be read or
    /// parsed, or lists no nameservers.
    pub fn local(config: &DnsConfig) -> Result<Self, DnsError> {
        let path = &config.resolv_conf_path;
        let contents = std::fs::read(path).map_err(|err| {
            DnsError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;

        let (resolver_config, mut opts) = parse_resolv_conf(&contents).map_err(|err| {
            DnsError::Configuration(format!("cannot parse {}: {err}", path.display()))
        })?;

        if resolver_config.name_servers().is_empty() {
            return Err(DnsError::Configuration(format!(
                "no nameservers listed in {}",
                path.display()
            )));
        }

        apply_timeout(&mut opts, config.timeout());
        debug!(
            path = %path.display(),
            nameservers = resolver_config.name_servers().len(),
            "Created local DNS resolver"
        );

        Ok(Self::from_config(resolver_config, opts, config.timeout()))
    }

    /// Creates a resolver that only queries `nameservers`.
    #[must_use]
    pub fn with_nameservers(nameservers: &[IpAddr], timeout: Duration) -> Self {
        let resolver_config = ResolverConfig::from_parts(
            None,
            Vec::new(),
            NameServerConfigGroup::from_ips_clear(nameservers, 53, true),
        );
        let mut opts = ResolverOpts::default();
        apply_timeout(&mut opts, timeout);

        Self::from_config(resolver_config, opts, timeout)
    }

    fn from_config(resolver_config: ResolverConfig, opts: ResolverOpts, timeout: Duration) -> Self {
        let resolver =
            TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self { resolver, timeout }
    }

    /// Builds a resolver that talks only to the authoritative nameservers of
    /// `name`, bypassing this resolver's cache.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NoNameservers`] if no nameserver address could be
    /// found.
    pub async fn for_domain(&self, name: &str) -> Result<Self, DnsError> {
        let options = LookupOptions::default();
        let mut addresses: Vec<IpAddr> = Vec::new();

        for nameserver in self.effective_ns(name, options).await? {
            for ip in self.a(&nameserver, options).await? {
                let ip = IpAddr::V4(ip);
                if !addresses.contains(&ip) {
                    addresses.push(ip);
                }
            }
        }

        if addresses.is_empty() {
            return Err(DnsError::NoNameservers(name.to_string()));
        }

        debug!(name, nameservers = ?addresses, "Created domain-scoped DNS resolver");
        Ok(Self::with_nameservers(&addresses, self.timeout))
    }

    pub async fn a(&self, name: &str, options: LookupOptions) -> Result<Vec<Ipv4Addr>, DnsError> {
        let query = query_name(name)?;
        let resolver = &self.resolver;
        self.with_timeouts("A", name, options, || {
            let query = query.clone();
            async move {
                resolver
                    .ipv4_lookup(query)
                    .await
                    .map(|lookup| lookup.iter().map(|record| record.0).collect())
            }
        })
        .await
    }

    pub async fn aaaa(
        &self,
        name: &str,
        options: LookupOptions,
    ) -> Result<Vec<Ipv6Addr>, DnsError> {
        let query = query_name(name)?;
        let resolver = &self.resolver;
        self.with_timeouts("AAAA", name, options, || {
            let query = query.clone();
            async move {
                resolver
                    .ipv6_lookup(query)
                    .await
                    .map(|lookup| lookup.iter().map(|record| record.0).collect())
            }
        })
        .await
    }

    /// TXT records, each with its character strings concatenated and trimmed.
    pub async fn txt(&self, name: &str, options: LookupOptions) -> Result<Vec<String>, DnsError> {
        let query = query_name(name)?;
        let resolver = &self.resolver;
        self.with_timeouts("TXT", name, options, || {
            let query = query.clone();
            async move {
                resolver.txt_lookup(query).await.map(|lookup| {
                    lookup
                        .iter()
                        .map(|txt| {
                            txt.txt_data()
                                .iter()
                                .map(|data| String::from_utf8_lossy(data))
                                .collect::<String>()
                                .trim()
                                .to_string()
                        })
                        .collect()
                })
            }
        })
        .await
    }

    /// CNAME targets, lowercased.
    pub async fn cname(
        &self,
        name: &str,
        options: LookupOptions,
    ) -> Result<Vec<String>, DnsError> {
        let query = query_name(name)?;
        let resolver = &self.resolver;
        self.with_timeouts("CNAME", name, options, || {
            let query = query.clone();
            async move {
                resolver
                    .lookup(query, RecordType::CNAME)
                    .await
                    .map(|lookup| {
                        lookup
                            .iter()
                            .filter_map(|rdata| match rdata {
                                RData::CNAME(cname) => Some(display_name(&cname.0).to_lowercase()),
                                _ => None,
                            })
                            .collect()
                    })
            }
        })
        .await
    }

    pub async fn mx(&self, name: &str, options: LookupOptions) -> Result<Vec<MxRecord>, DnsError> {
        let query = query_name(name)?;
        let resolver = &self.resolver;
        let records = self
            .with_timeouts("MX", name, options, || {
                let query = query.clone();
                async move {
                    resolver.mx_lookup(query).await.map(|lookup| {
                        lookup
                            .iter()
                            .map(|mx| MxRecord::new(mx.preference(), display_name(mx.exchange())))
                            .collect()
                    })
                }
            })
            .await?;

        Ok(sort_mx(records))
    }

    pub async fn ns(&self, name: &str, options: LookupOptions) -> Result<Vec<String>, DnsError> {
        let query = query_name(name)?;
        let resolver = &self.resolver;
        self.with_timeouts("NS", name, options, || {
            let query = query.clone();
            async move {
                resolver
                    .ns_lookup(query)
                    .await
                    .map(|lookup| lookup.iter().map(|ns| display_name(&ns.0)).collect())
            }
        })
        .await
    }

    /// The nameservers responsible for `name`.
    ///
    /// Starts with the full name and walks up one label at a time, stopping
    /// at the first level that has NS records. The top-level domain itself
    /// is never queried.
    pub async fn effective_ns(
        &self,
        name: &str,
        options: LookupOptions,
    ) -> Result<Vec<String>, DnsError> {
        for zone in candidate_zones(name) {
            let records = self.ns(&zone, options).await?;
            if !records.is_empty() {
                return Ok(records);
            }
        }

        Ok(Vec::new())
    }

    pub async fn ip_to_hostname(
        &self,
        ip: IpAddr,
        options: LookupOptions,
    ) -> Result<String, DnsError> {
        let resolver = &self.resolver;
        let names = self
            .with_timeouts("PTR", &ip.to_string(), options, || async move {
                resolver
                    .reverse_lookup(ip)
                    .await
                    .map(|lookup| lookup.iter().map(|ptr| display_name(&ptr.0)).collect())
            })
            .await?;

        Ok(names.into_iter().next().unwrap_or_else(|| ip.to_string()))
    }

    /// The primary timeout followed by two retries at half of it.
    #[must_use]
    pub fn timeouts(&self) -> [Duration; 3] {
        let retry = self.timeout / 2;
        [self.timeout, retry, retry]
    }

    async fn with_timeouts<T, F, Fut>(
        &self,
        kind: &'static str,
        name: &str,
        options: LookupOptions,
        lookup: F,
    ) -> Result<Vec<T>, DnsError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Vec<T>, ResolveError>>,
    {
        for (attempt, limit) in self.timeouts().into_iter().enumerate() {
            match tokio::time::timeout(limit, lookup()).await {
                Ok(Ok(records)) => return Ok(records),
                Ok(Err(err)) if err.is_no_records_found() || err.is_nx_domain() => {
                    return Ok(Vec::new());
                }
                Ok(Err(err)) => {
                    warn!(kind, name, error = %err, "DNS lookup failed");
                    return Ok(Vec::new());
                }
                Err(_) => debug!(kind, name, attempt, ?limit, "DNS lookup timed out"),
            }
        }

        if options.raise_timeout_errors {
            Err(DnsError::Timeout(name.to_string()))
        } else {
            Ok(Vec::new())
        }
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn a(&self, name: &str, options: LookupOptions) -> Result<Vec<Ipv4Addr>, DnsError> {
        Self::a(self, name, options).await
    }

    async fn aaaa(&self, name: &str, options: LookupOptions) -> Result<Vec<Ipv6Addr>, DnsError> {
        Self::aaaa(self, name, options).await
    }

    async fn mx(&self, name: &str, options: LookupOptions) -> Result<Vec<MxRecord>, DnsError> {
        Self::mx(self, name, options).await
    }

    async fn ip_to_hostname(
        &self,
        ip: IpAddr,
        options: LookupOptions,
    ) -> Result<String, DnsError> {
        Self::ip_to_hostname(self, ip, options).await
    }
}

/// hickory's own per-query timeout sits above the outer schedule so that the
/// schedule decides when a query has timed out.
fn apply_timeout(opts: &mut ResolverOpts, timeout: Duration) {
    opts.timeout = timeout * 2;
    opts.attempts = 1;
}

fn query_name(name: &str) -> Result<Name, DnsError> {
    let mut query = Name::from_utf8(name)
        .map_err(|err| DnsError::Lookup(format!("invalid name {name}: {err}")))?;
    query.set_fqdn(true);
    Ok(query)
}

fn display_name(name: &Name) -> String {
    name.to_ascii().trim_end_matches('.').to_string()
}

/// Orders by preference. Equal preferences come out in random order.
pub fn sort_mx(mut records: Vec<MxRecord>) -> Vec<MxRecord> {
    records.shuffle(&mut rand::rng());
    records.sort_by_key(|record| record.preference);
    records
}

/// `a.b.example.com` yields `a.b.example.com`, `b.example.com` and
/// `example.com`.
fn candidate_zones(name: &str) -> Vec<String> {
    let labels: Vec<&str> = name.trim_end_matches('.').split('.').collect();
    (0..labels.len().saturating_sub(1))
        .map(|start| labels[start..].join("."))
        .collect()
}
