use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::Job;
use crate::{Result, context::WorkerContext, dispatcher::Dispatcher, model::IpAddressRecord};

/// Claims one queued message at a time and hands it to the [`Dispatcher`].
///
/// Only rows that are unpinned, or pinned to an egress address bound on this
/// host, are claimed. Without a message store nothing is claimed: the call
/// fails before touching the queue.
#[derive(Debug)]
pub struct ProcessQueuedMessages {
    context: WorkerContext,
    thread: String,
}

impl ProcessQueuedMessages {
    #[must_use]
    pub fn new(context: WorkerContext, thread: impl Into<String>) -> Self {
        Self {
            context,
            thread: thread.into(),
        }
    }

    async fn local_ip_address_ids(&self) -> Result<Vec<i64>> {
        let local = local_addresses();
        let records = self.context.store()?.ip_addresses().await?;
        Ok(matching_ids(&records, &local))
    }
}

#[async_trait]
impl Job for ProcessQueuedMessages {
    fn name(&self) -> &'static str {
        "ProcessQueuedMessages"
    }

    async fn call(&mut self) -> Result<bool> {
        let ip_address_ids = self.local_ip_address_ids().await?;
        let token = self.context.identity().claim_token(&self.thread);

        let claimed = self
            .context
            .database()
            .queued_messages()
            .claim_next(&token, &ip_address_ids)
            .await?;

        let mut worked = false;
        for queued in claimed {
            worked = true;
            debug!(queued_message = queued.id, thread = %self.thread, "Claimed queued message");
            Dispatcher::new(&self.context, &self.thread).process(queued).await?;
        }

        Ok(worked)
    }
}

/// Addresses bound on this host, skipping loopback and link-local ones.
#[must_use]
pub fn local_addresses() -> Vec<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .iter()
            .map(if_addrs::Interface::ip)
            .filter(|ip| !is_local_address(ip))
            .collect(),
        Err(err) => {
            warn!("Cannot list network interfaces, only unpinned messages will be claimed: {err}");
            Vec::new()
        }
    }
}

/// Loopback, link-local and unspecified addresses. An IPv4-mapped IPv6
/// address is judged by the IPv4 address it carries.
#[must_use]
pub fn is_local_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_local_v4(*v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_local_v4(v4),
            None => v6.is_loopback() || v6.is_unspecified() || v6.is_unicast_link_local(),
        },
    }
}

const fn is_local_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_unspecified() || ip.is_link_local()
}

fn matching_ids(records: &[IpAddressRecord], local: &[IpAddr]) -> Vec<i64> {
    records
        .iter()
        .filter(|record| {
            local.iter().any(|ip| match ip {
                IpAddr::V4(v4) => *v4 == record.ipv4,
                IpAddr::V6(v6) => record.ipv6 == Some(*v6),
            })
        })
        .map(|record| record.id)
        .collect()
}
