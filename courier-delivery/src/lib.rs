//! Outbound delivery for queued mail and webhook requests
//!
//! This crate provides:
//! - The SQLite work queues and their claim/retry primitive
//! - SMTP and HTTP senders, and the dispatcher that picks between them
//! - The jobs and scheduled tasks run by the worker process
//! - DNS resolution, DKIM signing and the header helpers senders rely on

mod context;
pub mod dispatcher;
pub mod dkim;
pub mod dns;
mod error;
pub mod jobs;
pub mod model;
pub mod queue;
pub mod received_header;
pub mod reply_separator;
mod send_result;
pub mod sender;
pub mod signing;
pub mod smtp_client;
pub mod store;
pub mod tasks;

pub use context::{DeliverySettings, WorkerContext};
pub use dispatcher::Dispatcher;
pub use dkim::{DkimError, DkimSigner};
pub use dns::{DnsError, DnsResolver, LookupOptions, MxRecord, Resolve};
pub use error::{DeliveryError, Result, StoreError};
pub use jobs::{Job, ProcessQueuedMessages, ProcessWebhookRequests};
pub use queue::Database;
pub use send_result::{ResultType, Retry, SendResult, generate_log_id};
pub use signing::RequestSigner;
pub use store::{MemoryMessageStore, MessageStore};
pub use tasks::ScheduledTask;
