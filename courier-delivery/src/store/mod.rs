//! The message store collaborator.
//!
//! Messages, servers, routes, suppression lists and delivery history live
//! outside this crate. The dispatcher reaches them only through
//! [`MessageStore`].

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryMessageStore;

use crate::{
    Result,
    model::{IpAddressRecord, MailServer, Message, MessageScope, NewDelivery, Route, SendLimitState},
};

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn server(&self, server_id: i64) -> Result<Option<MailServer>>;

    async fn message(&self, server_id: i64, message_id: i64) -> Result<Option<Message>>;

    async fn route(&self, server_id: i64, route_id: i64) -> Result<Option<Route>>;

    async fn ip_address(&self, id: i64) -> Result<Option<IpAddressRecord>>;

    /// Every configured egress address.
    async fn ip_addresses(&self) -> Result<Vec<IpAddressRecord>>;

    /// Appends a delivery attempt to the message's history.
    async fn create_delivery(
        &self,
        server_id: i64,
        message_id: i64,
        delivery: NewDelivery,
    ) -> Result<()>;

    /// Queues a bounce to the message's sender.
    ///
    /// Returns the id of the bounce message, or `None` when the message
    /// should not be bounced (it is a bounce itself, or has no sender).
    async fn send_bounce(&self, server_id: i64, message_id: i64) -> Result<Option<i64>>;

    /// Why `address` is on the server's recipient suppression list, if it is.
    async fn suppression_reason(&self, server_id: i64, address: &str) -> Result<Option<String>>;

    /// Returns `false` when the address was already suppressed.
    async fn add_suppression(&self, server_id: i64, address: &str, reason: &str) -> Result<bool>;

    /// Returns `false` when the address was not suppressed.
    async fn remove_suppression(&self, server_id: i64, address: &str) -> Result<bool>;

    /// Messages to `rcpt_to` whose status is HardFail and that were sent
    /// after `since`.
    async fn hard_fails_since(
        &self,
        server_id: i64,
        rcpt_to: &str,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Counts a message towards the server's live statistics.
    async fn increment_live_stats(&self, server_id: i64, scope: &MessageScope) -> Result<()>;

    /// Outgoing messages counted in the last hour.
    async fn send_volume(&self, server_id: i64) -> Result<u64>;

    /// Records whether the server is near or over its send limit.
    async fn set_send_limit_state(&self, server_id: i64, state: SendLimitState) -> Result<()>;

    /// Ids of the outgoing messages a received bounce refers to.
    async fn original_messages(&self, server_id: i64, bounce_id: i64) -> Result<Vec<i64>>;

    /// Marks `bounce_id` as the bounce for `original_id`.
    async fn link_bounce(&self, server_id: i64, bounce_id: i64, original_id: i64) -> Result<()>;
}
