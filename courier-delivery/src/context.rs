use std::{fmt, sync::Arc, time::Duration};

use chrono::TimeDelta;
use courier_common::{
    config::{DeliveryConfig, DnsConfig, SmtpClientTimeouts, SocksProxy},
    identity::ProcessIdentity,
};

use crate::{
    DeliveryError, Result,
    dkim::DkimSigner,
    dns::Resolve,
    queue::Database,
    signing::RequestSigner,
    smtp_client::Server,
    store::MessageStore,
};

const DEFAULT_HELO_HOSTNAME: &str = "localhost";

/// Delivery policy resolved from configuration once at startup.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub maximum_delivery_attempts: u32,
    pub batch_queued_messages: bool,
    pub use_resent_sender_header: bool,
    /// Envelope sender domain when the sending domain has no verified return
    /// path.
    pub return_path_domain: String,
    pub custom_return_path_prefix: String,
    /// Smart hosts, replacing MX lookups when non-empty.
    pub relays: Vec<Server>,
    pub timeouts: SmtpClientTimeouts,
    pub helo_fallback: String,
    /// Signs mail from domains without their own verified key.
    pub platform_signer: Option<DkimSigner>,
    /// Signs HTTP endpoint requests. Uses the platform key.
    pub request_signer: Option<RequestSigner>,
    /// SMTP proxy for egress addresses that have none of their own.
    pub socks_proxy: Option<SocksProxy>,
    pub lock_stale_after: TimeDelta,
    pub webhook_retention: TimeDelta,
}

impl DeliverySettings {
    /// # Errors
    ///
    /// Fails on a malformed relay URL or an unreadable platform DKIM key.
    pub fn from_config(
        dns: &DnsConfig,
        delivery: &DeliveryConfig,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self> {
        let relays = delivery
            .smtp_relays
            .iter()
            .map(String::as_str)
            .map(Server::from_relay_url)
            .collect::<Result<Vec<_>>>()?;

        let platform_signer = dns
            .dkim_private_key_path
            .as_deref()
            .map(|path| DkimSigner::from_pem_file(&dns.return_path_domain, &dns.dkim_identifier, path))
            .transpose()?;

        let request_signer = platform_signer
            .as_ref()
            .map(|signer| RequestSigner::new(signer.key().clone()));

        let helo_fallback = dns
            .helo_hostname
            .clone()
            .or_else(|| delivery.smtp_hostname.clone())
            .unwrap_or_else(|| DEFAULT_HELO_HOSTNAME.to_string());

        Ok(Self {
            maximum_delivery_attempts: delivery.default_maximum_delivery_attempts,
            batch_queued_messages: delivery.batch_queued_messages,
            use_resent_sender_header: delivery.use_resent_sender_header,
            return_path_domain: dns.return_path_domain.clone(),
            custom_return_path_prefix: dns.custom_return_path_prefix.clone(),
            relays,
            timeouts,
            helo_fallback,
            platform_signer,
            request_signer,
            socks_proxy: delivery.socks_proxy.clone(),
            lock_stale_after: to_time_delta(delivery.lock_stale_after())?,
            webhook_retention: to_time_delta(delivery.webhook_retention())?,
        })
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        let dns = DnsConfig::default();
        let delivery = DeliveryConfig::default();

        Self {
            maximum_delivery_attempts: delivery.default_maximum_delivery_attempts,
            batch_queued_messages: delivery.batch_queued_messages,
            use_resent_sender_header: delivery.use_resent_sender_header,
            return_path_domain: dns.return_path_domain,
            custom_return_path_prefix: dns.custom_return_path_prefix,
            relays: Vec::new(),
            timeouts: SmtpClientTimeouts::default(),
            helo_fallback: DEFAULT_HELO_HOSTNAME.to_string(),
            platform_signer: None,
            request_signer: None,
            socks_proxy: None,
            lock_stale_after: TimeDelta::days(i64::from(delivery.queued_message_lock_stale_days)),
            webhook_retention: TimeDelta::days(i64::from(delivery.webhook_request_retention_days)),
        }
    }
}

fn to_time_delta(duration: Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(duration)
        .map_err(|err| DeliveryError::Configuration(format!("duration out of range: {err}")))
}

/// Everything a job or task needs, handed to it at construction.
///
/// Cheap to clone; each worker thread keeps its own copy.
#[derive(Clone)]
pub struct WorkerContext {
    identity: ProcessIdentity,
    database: Database,
    store: Option<Arc<dyn MessageStore>>,
    resolver: Arc<dyn Resolve>,
    http: reqwest::Client,
    settings: Arc<DeliverySettings>,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("identity", &self.identity)
            .field("database", &self.database)
            .field("store", &self.store.is_some())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    #[must_use]
    pub fn new(
        identity: ProcessIdentity,
        database: Database,
        store: Arc<dyn MessageStore>,
        resolver: Arc<dyn Resolve>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            identity,
            database,
            store: Some(store),
            resolver,
            http: reqwest::Client::new(),
            settings: Arc::new(settings),
        }
    }

    /// A context with no message store. Only work that never loads a
    /// message (webhook requests, queue maintenance) can run against it.
    #[must_use]
    pub fn without_store(
        identity: ProcessIdentity,
        database: Database,
        resolver: Arc<dyn Resolve>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            identity,
            database,
            store: None,
            resolver,
            http: reqwest::Client::new(),
            settings: Arc::new(settings),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.database
    }

    #[must_use]
    pub const fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// # Errors
    ///
    /// Fails when the context was built [`without_store`](Self::without_store).
    pub fn store(&self) -> Result<&dyn MessageStore> {
        self.store
            .as_deref()
            .ok_or_else(|| DeliveryError::Configuration("no message store attached".to_string()))
    }

    #[must_use]
    pub fn resolver(&self) -> &dyn Resolve {
        self.resolver.as_ref()
    }

    /// A handle to the resolver that can outlive this borrow.
    #[must_use]
    pub fn shared_resolver(&self) -> Arc<dyn Resolve> {
        Arc::clone(&self.resolver)
    }

    #[must_use]
    pub const fn http(&self) -> &reqwest::Client {
        &self.http
    }

    #[must_use]
    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    #[must_use]
    pub fn shared_settings(&self) -> Arc<DeliverySettings> {
        Arc::clone(&self.settings)
    }
}
