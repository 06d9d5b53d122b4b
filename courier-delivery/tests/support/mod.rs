//! Shared fixtures for the delivery integration tests.
#![allow(dead_code)]

pub mod http_server;
pub mod mock_server;
pub mod socks_server;

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use courier_common::identity::ProcessIdentity;
use courier_delivery::{
    Database, DeliverySettings, DnsError, LookupOptions, MemoryMessageStore, MxRecord, Resolve,
    WorkerContext,
    model::{Domain, MailServer, Message, MessageScope},
};

pub const RAW_MESSAGE: &str = "From: Alice <alice@example.com>\r\n\
    To: Bob <bob@example.net>\r\n\
    Subject: Delivery test\r\n\
    Message-ID: <delivery-test@example.com>\r\n\
    \r\n\
    Hello Bob.\r\n";

/// Resolves every listed name to a fixed address. Everything else has no
/// records.
#[derive(Debug, Default)]
pub struct LocalResolver {
    hosts: HashMap<String, Ipv4Addr>,
    mx: HashMap<String, Vec<MxRecord>>,
}

impl LocalResolver {
    #[must_use]
    pub fn with_host(mut self, name: &str) -> Self {
        self.hosts.insert(name.to_string(), Ipv4Addr::LOCALHOST);
        self
    }

    #[must_use]
    pub fn with_mx(mut self, domain: &str, exchange: &str) -> Self {
        self.mx
            .entry(domain.to_string())
            .or_default()
            .push(MxRecord::new(10, exchange));
        self
    }
}

#[async_trait]
impl Resolve for LocalResolver {
    async fn a(&self, name: &str, _options: LookupOptions) -> Result<Vec<Ipv4Addr>, DnsError> {
        Ok(self.hosts.get(name).copied().into_iter().collect())
    }

    async fn aaaa(&self, _name: &str, _options: LookupOptions) -> Result<Vec<Ipv6Addr>, DnsError> {
        Ok(Vec::new())
    }

    async fn mx(&self, name: &str, _options: LookupOptions) -> Result<Vec<MxRecord>, DnsError> {
        Ok(self.mx.get(name).cloned().unwrap_or_default())
    }

    async fn ip_to_hostname(&self, ip: IpAddr, _options: LookupOptions) -> Result<String, DnsError> {
        Ok(ip.to_string())
    }
}

pub fn outgoing_message(id: i64, rcpt_to: &str) -> Message {
    Message {
        id,
        server_id: 1,
        token: "srv1token".to_string(),
        scope: MessageScope::Outgoing,
        rcpt_to: rcpt_to.to_string(),
        mail_from: "alice@example.com".to_string(),
        bounce: false,
        domain: Some(Domain::new(1, "example.com")),
        credential: None,
        route_id: None,
        subject: Some("Delivery test".to_string()),
        message_id: Some("delivery-test@example.com".to_string()),
        timestamp: Utc::now(),
        size: RAW_MESSAGE.len(),
        spam_status: "NotChecked".to_string(),
        received_with_ssl: false,
        raw_message: Some(RAW_MESSAGE.as_bytes().to_vec()),
    }
}

pub fn incoming_message(id: i64, route_id: i64) -> Message {
    let mut message = outgoing_message(id, "support@example.com");
    message.scope = MessageScope::Incoming;
    message.domain = None;
    message.route_id = Some(route_id);
    message
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<MemoryMessageStore>,
    pub context: WorkerContext,
}

impl Harness {
    pub async fn new(resolver: LocalResolver, settings: DeliverySettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::open_path(&dir.path().join("queue.db"), 8)
            .await
            .unwrap();

        let store = Arc::new(MemoryMessageStore::new());
        store.add_server(MailServer::new(1, "srv1token"));

        let context = WorkerContext::new(
            ProcessIdentity::new("worker.test", 4242),
            database,
            store.clone(),
            Arc::new(resolver),
            settings,
        );

        Self {
            dir,
            store,
            context,
        }
    }

    pub fn database(&self) -> &Database {
        self.context.database()
    }
}
