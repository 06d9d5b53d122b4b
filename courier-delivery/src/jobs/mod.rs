//! Jobs polled by the worker's work threads.

mod process_queued_messages;
mod process_webhook_requests;

use async_trait::async_trait;

pub use process_queued_messages::{ProcessQueuedMessages, is_local_address, local_addresses};
pub use process_webhook_requests::{
    HttpWebhookDeliverer, ProcessWebhookRequests, WEBHOOK_RETRIES, WebhookDeliverer,
    WebhookRequestHandle, retry_delay_for,
};

use crate::Result;

/// One unit of polled work.
///
/// A work thread owns its jobs and calls each of them once per tick.
#[async_trait]
pub trait Job: Send {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Runs one tick. Returns whether any work was found, in which case the
    /// thread polls again without sleeping.
    async fn call(&mut self) -> Result<bool>;
}
