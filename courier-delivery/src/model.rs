//! Records owned by the message store and handed to the dispatcher.
//!
//! None of these are persisted by this crate; the [`MessageStore`](crate::MessageStore)
//! collaborator loads them by id.

use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use courier_common::config::{SocksProxy, SslMode};

use crate::smtp_client::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    #[default]
    Live,
    /// Outbound mail is held rather than delivered.
    Development,
}

/// A mail server (tenant) as seen by the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailServer {
    pub id: i64,
    /// Used as the local part of envelope senders.
    pub token: String,
    pub mode: ServerMode,
    pub suspended: bool,
    /// Omit client details from trace headers.
    pub privacy_mode: bool,
    /// Outgoing messages allowed per hour. `None` is unlimited.
    pub send_limit: Option<u64>,
}

impl MailServer {
    #[must_use]
    pub fn new(id: i64, token: impl Into<String>) -> Self {
        Self {
            id,
            token: token.into(),
            mode: ServerMode::Live,
            suspended: false,
            privacy_mode: false,
            send_limit: None,
        }
    }

    /// Where `send_volume` stands against the send limit.
    #[must_use]
    pub fn send_limit_state(&self, send_volume: u64) -> SendLimitState {
        let Some(limit) = self.send_limit else {
            return SendLimitState::Normal;
        };
        // Approaching from 90% of the limit.
        if send_volume >= limit {
            SendLimitState::Exceeded
        } else if send_volume.saturating_mul(10) >= limit.saturating_mul(9) {
            SendLimitState::Approaching
        } else {
            SendLimitState::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendLimitState {
    #[default]
    Normal,
    Approaching,
    Exceeded,
}

/// The SMTP or API credential a message was submitted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: i64,
    pub name: String,
    /// Hold every message submitted with this credential.
    pub hold: bool,
}

/// Result of the last DNS check of a domain record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordStatus {
    Ok,
    Missing,
    Invalid,
    #[default]
    Unchecked,
}

/// A sending domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub id: i64,
    pub name: String,
    pub return_path_status: RecordStatus,
    pub dkim_status: RecordStatus,
    /// PEM encoded RSA key.
    pub dkim_private_key: Option<String>,
    /// DKIM selector published for this domain.
    pub dkim_identifier: String,
}

impl Domain {
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            return_path_status: RecordStatus::Unchecked,
            dkim_status: RecordStatus::Unchecked,
            dkim_private_key: None,
            dkim_identifier: String::new(),
        }
    }

    /// `{prefix}.{name}`, the domain's own bounce address domain.
    #[must_use]
    pub fn return_path_domain(&self, prefix: &str) -> String {
        format!("{prefix}.{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageScope {
    Incoming,
    Outgoing,
    Other(String),
}

impl std::fmt::Display for MessageScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incoming => f.write_str("incoming"),
            Self::Outgoing => f.write_str("outgoing"),
            Self::Other(scope) => f.write_str(scope),
        }
    }
}

/// A stored message and the metadata senders need.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub server_id: i64,
    pub token: String,
    pub scope: MessageScope,
    pub rcpt_to: String,
    pub mail_from: String,
    /// This message is itself a bounce.
    pub bounce: bool,
    pub domain: Option<Domain>,
    pub credential: Option<Credential>,
    pub route_id: Option<i64>,
    pub subject: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub size: usize,
    pub spam_status: String,
    pub received_with_ssl: bool,
    /// `None` once the raw message has been purged from storage.
    pub raw_message: Option<Vec<u8>>,
}

impl Message {
    /// The part of `rcpt_to` after the last `@`.
    #[must_use]
    pub fn recipient_domain(&self) -> &str {
        self.rcpt_to
            .rsplit_once('@')
            .map_or(self.rcpt_to.as_str(), |(_, domain)| domain)
    }
}

/// What to do with incoming mail for a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMode {
    Accept,
    Hold,
    Bounce,
    Reject,
    Endpoint(RouteEndpoint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: i64,
    pub name: String,
    pub mode: RouteMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEndpoint {
    Smtp(SmtpEndpoint),
    Http(HttpEndpoint),
    Address(AddressEndpoint),
    /// An endpoint kind this engine cannot deliver to.
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpEndpoint {
    pub id: i64,
    pub hostname: String,
    pub port: u16,
    pub ssl_mode: SslMode,
}

impl SmtpEndpoint {
    #[must_use]
    pub fn to_server(&self) -> Server {
        Server::new(self.hostname.clone())
            .with_port(self.port)
            .with_ssl_mode(self.ssl_mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpEncoding {
    #[default]
    BodyAsJson,
    FormData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// Parsed message fields.
    #[default]
    Hash,
    /// The whole message, base64 encoded.
    RawMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpEndpoint {
    pub id: i64,
    pub url: String,
    pub encoding: HttpEncoding,
    pub format: PayloadFormat,
    pub strip_replies: bool,
    pub include_attachments: bool,
    /// Request timeout in seconds.
    pub timeout: Option<u64>,
}

impl HttpEndpoint {
    #[must_use]
    pub fn new(id: i64, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            encoding: HttpEncoding::default(),
            format: PayloadFormat::default(),
            strip_replies: false,
            include_attachments: false,
            timeout: None,
        }
    }
}

/// Forward to another mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEndpoint {
    pub id: i64,
    pub address: String,
}

impl AddressEndpoint {
    #[must_use]
    pub fn domain(&self) -> &str {
        self.address
            .rsplit_once('@')
            .map_or(self.address.as_str(), |(_, domain)| domain)
    }
}

/// A configured egress address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAddressRecord {
    pub id: i64,
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    /// Reverse DNS name, announced in EHLO.
    pub hostname: String,
    /// Tunnel connections from this address through a SOCKS5 proxy.
    pub proxy: Option<SocksProxy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    SoftFail,
    HardFail,
    Held,
    Processed,
    /// A bounce has been received for the message.
    Bounced,
    Error,
}

impl DeliveryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "Sent",
            Self::SoftFail => "SoftFail",
            Self::HardFail => "HardFail",
            Self::Held => "Held",
            Self::Processed => "Processed",
            Self::Bounced => "Bounced",
            Self::Error => "Error",
        }
    }
}

/// A delivery attempt record, written through the message store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDelivery {
    pub status: DeliveryStatus,
    pub details: String,
    pub output: String,
    pub sent_with_ssl: bool,
    pub log_id: Option<String>,
    pub time: Option<f64>,
}

impl NewDelivery {
    #[must_use]
    pub fn new(status: DeliveryStatus, details: impl Into<String>) -> Self {
        Self {
            status,
            details: details.into(),
            output: String::new(),
            sent_with_ssl: false,
            log_id: None,
            time: None,
        }
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}
