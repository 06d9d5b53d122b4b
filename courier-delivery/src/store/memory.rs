use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use super::MessageStore;
use crate::{
    Result,
    model::{
        DeliveryStatus, IpAddressRecord, MailServer, Message, MessageScope, NewDelivery, Route,
        SendLimitState,
    },
};

/// First id handed out to generated bounce messages.
const FIRST_BOUNCE_ID: i64 = 1_000_000;

#[derive(Debug, Default)]
struct Inner {
    servers: HashMap<i64, MailServer>,
    messages: HashMap<(i64, i64), Message>,
    routes: HashMap<(i64, i64), Route>,
    ip_addresses: Vec<IpAddressRecord>,
    deliveries: Vec<(i64, NewDelivery)>,
    bounces: Vec<(i64, i64)>,
    bounces_sent: i64,
    suppressions: HashMap<(i64, String), String>,
    hard_fails: Vec<(i64, String, DateTime<Utc>)>,
    outgoing_stats: HashMap<i64, Vec<DateTime<Utc>>>,
    send_limit_states: HashMap<i64, SendLimitState>,
    originals: HashMap<(i64, i64), Vec<i64>>,
    bounce_links: HashSet<(i64, i64)>,
}

/// A [`MessageStore`] held entirely in memory.
///
/// Used by tests and by embedders that keep messages in process.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    inner: Mutex<Inner>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, server: MailServer) {
        self.inner.lock().servers.insert(server.id, server);
    }

    pub fn add_message(&self, message: Message) {
        self.inner
            .lock()
            .messages
            .insert((message.server_id, message.id), message);
    }

    pub fn remove_message(&self, server_id: i64, message_id: i64) {
        self.inner.lock().messages.remove(&(server_id, message_id));
    }

    pub fn add_route(&self, server_id: i64, route: Route) {
        self.inner.lock().routes.insert((server_id, route.id), route);
    }

    pub fn add_ip_address(&self, record: IpAddressRecord) {
        self.inner.lock().ip_addresses.push(record);
    }

    /// Declares which outgoing messages the bounce `bounce_id` refers to.
    pub fn set_original_messages(&self, server_id: i64, bounce_id: i64, originals: &[i64]) {
        self.inner
            .lock()
            .originals
            .insert((server_id, bounce_id), originals.to_vec());
    }

    /// Deliveries recorded for `message_id`, oldest first.
    #[must_use]
    pub fn deliveries(&self, message_id: i64) -> Vec<NewDelivery> {
        self.inner
            .lock()
            .deliveries
            .iter()
            .filter(|(id, _)| *id == message_id)
            .map(|(_, delivery)| delivery.clone())
            .collect()
    }

    /// `(original message id, bounce id)` pairs.
    #[must_use]
    pub fn bounces(&self) -> Vec<(i64, i64)> {
        self.inner.lock().bounces.clone()
    }

    #[must_use]
    pub fn is_suppressed(&self, server_id: i64, address: &str) -> bool {
        self.inner
            .lock()
            .suppressions
            .contains_key(&(server_id, address.to_lowercase()))
    }

    #[must_use]
    pub fn send_limit_state(&self, server_id: i64) -> SendLimitState {
        self.inner
            .lock()
            .send_limit_states
            .get(&server_id)
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_bounce_linked(&self, bounce_id: i64, original_id: i64) -> bool {
        self.inner.lock().bounce_links.contains(&(bounce_id, original_id))
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn server(&self, server_id: i64) -> Result<Option<MailServer>> {
        Ok(self.inner.lock().servers.get(&server_id).cloned())
    }

    async fn message(&self, server_id: i64, message_id: i64) -> Result<Option<Message>> {
        Ok(self
            .inner
            .lock()
            .messages
            .get(&(server_id, message_id))
            .cloned())
    }

    async fn route(&self, server_id: i64, route_id: i64) -> Result<Option<Route>> {
        Ok(self.inner.lock().routes.get(&(server_id, route_id)).cloned())
    }

    async fn ip_address(&self, id: i64) -> Result<Option<IpAddressRecord>> {
        Ok(self
            .inner
            .lock()
            .ip_addresses
            .iter()
            .find(|record| record.id == id)
            .cloned())
    }

    async fn ip_addresses(&self) -> Result<Vec<IpAddressRecord>> {
        Ok(self.inner.lock().ip_addresses.clone())
    }

    async fn create_delivery(
        &self,
        server_id: i64,
        message_id: i64,
        delivery: NewDelivery,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if delivery.status == DeliveryStatus::HardFail
            && let Some(message) = inner.messages.get(&(server_id, message_id))
        {
            let rcpt_to = message.rcpt_to.to_lowercase();
            inner.hard_fails.push((server_id, rcpt_to, Utc::now()));
        }
        inner.deliveries.push((message_id, delivery));
        Ok(())
    }

    async fn send_bounce(&self, server_id: i64, message_id: i64) -> Result<Option<i64>> {
        let mut inner = self.inner.lock();
        let bounceable = inner
            .messages
            .get(&(server_id, message_id))
            .is_some_and(|message| !message.bounce && !message.mail_from.is_empty());
        if !bounceable {
            return Ok(None);
        }

        let bounce_id = FIRST_BOUNCE_ID + inner.bounces_sent;
        inner.bounces_sent += 1;
        inner.bounces.push((message_id, bounce_id));
        Ok(Some(bounce_id))
    }

    async fn suppression_reason(&self, server_id: i64, address: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .suppressions
            .get(&(server_id, address.to_lowercase()))
            .cloned())
    }

    async fn add_suppression(&self, server_id: i64, address: &str, reason: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let key = (server_id, address.to_lowercase());
        if inner.suppressions.contains_key(&key) {
            return Ok(false);
        }
        inner.suppressions.insert(key, reason.to_string());
        Ok(true)
    }

    async fn remove_suppression(&self, server_id: i64, address: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .suppressions
            .remove(&(server_id, address.to_lowercase()))
            .is_some())
    }

    async fn hard_fails_since(
        &self,
        server_id: i64,
        rcpt_to: &str,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let rcpt_to = rcpt_to.to_lowercase();
        let count = self
            .inner
            .lock()
            .hard_fails
            .iter()
            .filter(|(server, address, at)| *server == server_id && *address == rcpt_to && *at > since)
            .count();
        Ok(count as u64)
    }

    async fn increment_live_stats(&self, server_id: i64, scope: &MessageScope) -> Result<()> {
        if *scope == MessageScope::Outgoing {
            self.inner
                .lock()
                .outgoing_stats
                .entry(server_id)
                .or_default()
                .push(Utc::now());
        }
        Ok(())
    }

    async fn send_volume(&self, server_id: i64) -> Result<u64> {
        let since = Utc::now() - TimeDelta::hours(1);
        let count = self
            .inner
            .lock()
            .outgoing_stats
            .get(&server_id)
            .map_or(0, |stats| stats.iter().filter(|at| **at > since).count());
        Ok(count as u64)
    }

    async fn set_send_limit_state(&self, server_id: i64, state: SendLimitState) -> Result<()> {
        self.inner.lock().send_limit_states.insert(server_id, state);
        Ok(())
    }

    async fn original_messages(&self, server_id: i64, bounce_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .inner
            .lock()
            .originals
            .get(&(server_id, bounce_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn link_bounce(&self, _server_id: i64, bounce_id: i64, original_id: i64) -> Result<()> {
        self.inner.lock().bounce_links.insert((bounce_id, original_id));
        Ok(())
    }
}
