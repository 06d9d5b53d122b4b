use std::collections::{HashMap, hash_map::Entry};

use tracing::debug;

use crate::{
    dns::DnsError,
    send_result::SendResult,
    sender::{Sender, SenderKey},
};

/// What one batch shares: started senders, and the result of a failed
/// connection so the rest of the batch does not try again.
#[derive(Debug, Default)]
pub struct DispatchState {
    senders: HashMap<SenderKey, Sender>,
    pub send_result: Option<SendResult>,
}

impl DispatchState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached sender for `key`, or a new one from `build`, started.
    ///
    /// A sender whose start fails is not cached.
    pub async fn sender_for(
        &mut self,
        key: SenderKey,
        build: impl FnOnce() -> Sender,
    ) -> Result<&mut Sender, DnsError> {
        match self.senders.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut sender = build();
                if let Err(err) = sender.start().await {
                    sender.finish().await;
                    return Err(err);
                }
                debug!(key = ?entry.key(), "Started sender");
                Ok(entry.insert(sender))
            }
        }
    }

    #[must_use]
    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Finishes every cached sender.
    pub async fn finished(&mut self) {
        for sender in self.senders.values_mut() {
            sender.finish().await;
        }
    }
}
