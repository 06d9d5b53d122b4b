//! Turns a claimed queue row into a delivery attempt.
//!
//! The dispatcher checks that the message can still be sent, picks a
//! [`Sender`] from the message scope and route, and records the outcome
//! against the message before deleting or rescheduling the row. Rows that
//! share a batch key are claimed together and reuse one set of senders.

mod state;

use chrono::{TimeDelta, Utc};
use tracing::{Instrument, debug, error, info, info_span, warn};

pub use state::DispatchState;

use crate::{
    DeliveryError, Result,
    context::WorkerContext,
    model::{
        DeliveryStatus, IpAddressRecord, MailServer, Message, MessageScope, NewDelivery,
        RouteEndpoint, RouteMode, SendLimitState, ServerMode,
    },
    queue::{Lockable, QueuedMessage},
    send_result::{ResultType, SendResult},
    sender::{HttpSender, Sender, SenderKey, SmtpSender},
};

/// Most rows claimed alongside the first one in a batch.
pub const BATCH_LIMIT: i64 = 100;

const SUSPENDED: &str =
    "Mail server has been suspended. No e-mails can be processed at present. Contact support for assistance.";
const DEVELOPMENT_MODE: &str = "Server is in development mode.";
const RAW_MESSAGE_REMOVED: &str = "Raw message has been removed. Cannot send message.";
const NO_DOMAIN: &str = "Message's domain no longer exist";
const NO_RCPT_TO: &str = "Message doesn't have an RCPT to";
const NO_ROUTE: &str = "Message does not have a route and/or endpoint available for delivery.";
const ACCEPTED: &str = "Message has been accepted but not sent to any endpoints.";
const PROCESSED: &str = "Message has been processed.";
const INTERNAL_ERROR: &str =
    "An internal error occurred while sending this message. This message will be retried automatically.";
const CREDENTIAL_HOLD: &str = "Credential is configured to hold all messages authenticated by it.";
const UNLINKED_BOUNCE: &str = "This message was a bounce but we couldn't link it with any outgoing message and there was no route for it.";
const TOO_MANY_HARD_FAILS: &str = "too many hard fails";
const TOO_MANY_SOFT_FAILS: &str = "too many soft fails";

/// How far back earlier hard fails count towards suppressing a recipient.
const HARD_FAIL_WINDOW: TimeDelta = TimeDelta::hours(24);

/// Delivers claimed queue rows for one worker thread.
#[derive(Debug)]
pub struct Dispatcher<'a> {
    context: &'a WorkerContext,
    thread: &'a str,
}

impl<'a> Dispatcher<'a> {
    #[must_use]
    pub const fn new(context: &'a WorkerContext, thread: &'a str) -> Self {
        Self { context, thread }
    }

    /// Processes `queued`, which this thread has claimed, along with any
    /// rows that can be batched with it.
    ///
    /// Failures of an individual row are recorded against that row. Only a
    /// failure before any row is attempted is returned.
    pub async fn process(&self, queued: QueuedMessage) -> Result<()> {
        let repo = self.context.database().queued_messages();

        if let Some(metrics) = courier_metrics::metrics() {
            let latency = Utc::now().signed_duration_since(queued.created_at);
            metrics
                .worker
                .record_queue_latency(latency.to_std().unwrap_or_default());
        }

        let exists = self
            .context
            .store()?
            .message(queued.server_id, queued.message_id)
            .await?
            .is_some();
        if !exists {
            info!(queued_message = queued.id, "Message has been removed, dropping queued message");
            repo.delete(&queued).await?;
            return Ok(());
        }

        if !queued.is_ready() {
            debug!(queued_message = queued.id, "Not ready for delivery yet, unlocking");
            repo.unlock(&queued).await?;
            return Ok(());
        }

        let mut rows = Vec::new();
        if self.context.settings().batch_queued_messages {
            let token = self.context.identity().claim_token(self.thread);
            match repo.claim_batch(&token, &queued, BATCH_LIMIT).await {
                Ok(batch) => rows = batch,
                Err(err) => {
                    repo.unlock(&queued).await?;
                    return Err(err.into());
                }
            }
            if !rows.is_empty() {
                debug!(queued_message = queued.id, batched = rows.len(), "Claimed batch");
            }
        }
        rows.insert(0, queued);

        let mut state = DispatchState::new();
        for row in &rows {
            let span = info_span!("queued_message", id = row.id, message_id = row.message_id);
            self.process_row(row, &mut state).instrument(span).await;
        }
        state.finished().await;

        Ok(())
    }

    async fn process_row(&self, queued: &QueuedMessage, state: &mut DispatchState) {
        if let Err(err) = self.deliver(queued, state).await {
            self.handle_error(queued, &err).await;
        }
    }

    async fn deliver(&self, queued: &QueuedMessage, state: &mut DispatchState) -> Result<()> {
        let store = self.context.store()?;
        let settings = self.context.settings();

        let Some(message) = store.message(queued.server_id, queued.message_id).await? else {
            info!("Message has been removed, dropping queued message");
            return self.remove(queued).await;
        };

        let Some(server) = store.server(queued.server_id).await? else {
            warn!(server_id = queued.server_id, "Mail server no longer exists, dropping queued message");
            return self.remove(queued).await;
        };

        if server.suspended {
            info!("Mail server is suspended, holding message");
            return self
                .conclude(queued, &message, NewDelivery::new(DeliveryStatus::Held, SUSPENDED))
                .await;
        }

        let maximum = i64::from(settings.maximum_delivery_attempts);
        if queued.attempts >= maximum {
            let mut details = format!("Maximum number of delivery attempts ({maximum}) has been reached.");
            match message.scope {
                MessageScope::Incoming => {
                    if let Some(bounce_id) = store.send_bounce(message.server_id, message.id).await? {
                        details.push_str(&format!(" Bounce sent to sender (see message <msg:{bounce_id}>)"));
                    }
                }
                MessageScope::Outgoing => {
                    if store
                        .add_suppression(message.server_id, &message.rcpt_to, TOO_MANY_SOFT_FAILS)
                        .await?
                    {
                        info!(rcpt_to = %message.rcpt_to, "Added recipient to suppression list");
                        details.push_str(&format!(
                            " Added {} to suppression list because delivery has failed {} times.",
                            message.rcpt_to, queued.attempts
                        ));
                    }
                }
                MessageScope::Other(_) => {}
            }
            info!(attempts = queued.attempts, "Giving up on message");
            return self
                .conclude(queued, &message, NewDelivery::new(DeliveryStatus::HardFail, details))
                .await;
        }

        if message.raw_message.is_none() {
            return self
                .conclude(queued, &message, NewDelivery::new(DeliveryStatus::HardFail, RAW_MESSAGE_REMOVED))
                .await;
        }

        match &message.scope {
            MessageScope::Outgoing => self.deliver_outgoing(queued, &message, &server, state).await,
            MessageScope::Incoming => self.deliver_incoming(queued, &message, &server, state).await,
            MessageScope::Other(scope) => {
                let details = format!("Scope {scope} is not valid");
                self.conclude(queued, &message, NewDelivery::new(DeliveryStatus::HardFail, details))
                    .await
            }
        }
    }

    async fn deliver_outgoing(
        &self,
        queued: &QueuedMessage,
        message: &Message,
        server: &MailServer,
        state: &mut DispatchState,
    ) -> Result<()> {
        if message.domain.is_none() {
            return self
                .conclude(queued, message, NewDelivery::new(DeliveryStatus::HardFail, NO_DOMAIN))
                .await;
        }

        if message.rcpt_to.trim().is_empty() {
            return self
                .conclude(queued, message, NewDelivery::new(DeliveryStatus::HardFail, NO_RCPT_TO))
                .await;
        }

        let store = self.context.store()?;

        if !queued.manual && message.credential.as_ref().is_some_and(|credential| credential.hold) {
            info!("Credential wants messages held, holding");
            return self
                .conclude(queued, message, NewDelivery::new(DeliveryStatus::Held, CREDENTIAL_HOLD))
                .await;
        }

        if !queued.manual
            && let Some(reason) = store.suppression_reason(message.server_id, &message.rcpt_to).await?
        {
            info!(rcpt_to = %message.rcpt_to, "Recipient is on the suppression list, holding");
            let details = format!(
                "Recipient ({}) is on the suppression list (reason: {reason})",
                message.rcpt_to
            );
            return self
                .conclude(queued, message, NewDelivery::new(DeliveryStatus::Held, details))
                .await;
        }

        if self.check_send_limit(server).await? == SendLimitState::Exceeded {
            let limit = server.send_limit.unwrap_or_default();
            info!(send_limit = limit, "Server send limit has been exceeded, holding");
            let details = format!("Message held because send limit ({limit}) has been reached.");
            return self
                .conclude(queued, message, NewDelivery::new(DeliveryStatus::Held, details))
                .await;
        }

        store.increment_live_stats(message.server_id, &message.scope).await?;

        if let Some(held) = self.hold_in_development(queued, message, server).await {
            return held;
        }

        let result = if let Some(cached) = state.send_result.clone() {
            debug!("Reusing connection failure from earlier in the batch");
            cached
        } else {
            let domain = message.recipient_domain().to_string();
            let source = self.source_address(queued).await?;
            let key = SenderKey::Smtp {
                domain: domain.clone(),
                ip_address_id: queued.ip_address_id,
                servers: None,
                rcpt_to: None,
            };
            let settings = self.context.shared_settings();
            let resolver = self.context.shared_resolver();
            let build = move || Sender::Smtp(Box::new(SmtpSender::new(domain, source, settings, resolver)));

            let result = self.send_with(state, key, build, message, server).await?;
            if result.connect_error {
                state.send_result = Some(result.clone());
            }
            result
        };

        let extra = self.update_suppression_list(message, &result).await?;
        self.complete(queued, message, &result, extra).await
    }

    /// Compares the server's recent volume to its send limit and records
    /// the state through the store.
    async fn check_send_limit(&self, server: &MailServer) -> Result<SendLimitState> {
        let store = self.context.store()?;
        let state = match server.send_limit {
            Some(_) => server.send_limit_state(store.send_volume(server.id).await?),
            None => SendLimitState::Normal,
        };
        store.set_send_limit_state(server.id, state).await?;
        Ok(state)
    }

    async fn hold_in_development(
        &self,
        queued: &QueuedMessage,
        message: &Message,
        server: &MailServer,
    ) -> Option<Result<()>> {
        if queued.manual || server.mode != ServerMode::Development {
            return None;
        }
        info!("Mail server is in development mode, holding message");
        Some(
            self.conclude(queued, message, NewDelivery::new(DeliveryStatus::Held, DEVELOPMENT_MODE))
                .await,
        )
    }

    /// Suppresses a recipient that keeps hard failing, and lifts the
    /// suppression once mail to them is accepted. Returns the note to add
    /// to the delivery details.
    async fn update_suppression_list(
        &self,
        message: &Message,
        result: &SendResult,
    ) -> Result<Option<&'static str>> {
        let store = self.context.store()?;
        match result.result_type {
            ResultType::HardFail => {
                let since = Utc::now() - HARD_FAIL_WINDOW;
                let recent = store
                    .hard_fails_since(message.server_id, &message.rcpt_to, since)
                    .await?;
                if recent >= 1
                    && store
                        .add_suppression(message.server_id, &message.rcpt_to, TOO_MANY_HARD_FAILS)
                        .await?
                {
                    info!(rcpt_to = %message.rcpt_to, recent, "Added recipient to suppression list");
                    return Ok(Some("Recipient added to suppression list (too many hard fails)"));
                }
            }
            ResultType::Sent => {
                if store.remove_suppression(message.server_id, &message.rcpt_to).await? {
                    info!(rcpt_to = %message.rcpt_to, "Removed recipient from suppression list");
                    return Ok(Some("Recipient removed from suppression list"));
                }
            }
            ResultType::SoftFail => {}
        }
        Ok(None)
    }

    async fn deliver_incoming(
        &self,
        queued: &QueuedMessage,
        message: &Message,
        server: &MailServer,
        state: &mut DispatchState,
    ) -> Result<()> {
        let store = self.context.store()?;

        if message.bounce {
            let originals = store.original_messages(message.server_id, message.id).await?;
            if !originals.is_empty() {
                for original_id in originals {
                    store.link_bounce(message.server_id, message.id, original_id).await?;
                    store
                        .create_delivery(
                            message.server_id,
                            message.id,
                            NewDelivery::new(
                                DeliveryStatus::Processed,
                                format!("This has been detected as a bounce message for <msg:{original_id}>."),
                            ),
                        )
                        .await?;
                    store
                        .create_delivery(
                            message.server_id,
                            original_id,
                            NewDelivery::new(
                                DeliveryStatus::Bounced,
                                format!(
                                    "We've received a bounce message for this e-mail. See <msg:{}> for details.",
                                    message.id
                                ),
                            ),
                        )
                        .await?;
                    info!(original_id, "Bounce linked with message");
                }
                return self.remove(queued).await;
            }

            if message.route_id.is_none() {
                info!("Bounce matches no outgoing message and has no route, hard failing");
                return self
                    .conclude(queued, message, NewDelivery::new(DeliveryStatus::HardFail, UNLINKED_BOUNCE))
                    .await;
            }
        }

        store.increment_live_stats(message.server_id, &message.scope).await?;

        if let Some(held) = self.hold_in_development(queued, message, server).await {
            return held;
        }

        let route = match message.route_id {
            Some(route_id) => store.route(message.server_id, route_id).await?,
            None => None,
        };
        let Some(route) = route else {
            return self
                .conclude(queued, message, NewDelivery::new(DeliveryStatus::HardFail, NO_ROUTE))
                .await;
        };

        let result = match route.mode {
            RouteMode::Accept => {
                return self
                    .conclude(queued, message, NewDelivery::new(DeliveryStatus::Processed, ACCEPTED))
                    .await;
            }
            RouteMode::Hold => {
                let delivery = if queued.manual {
                    NewDelivery::new(DeliveryStatus::Processed, PROCESSED)
                } else {
                    NewDelivery::new(DeliveryStatus::Held, ACCEPTED)
                };
                return self.conclude(queued, message, delivery).await;
            }
            RouteMode::Bounce | RouteMode::Reject => {
                let mut details =
                    "Message has been bounced because the route asks for this.".to_string();
                if let Some(bounce_id) = store.send_bounce(message.server_id, message.id).await? {
                    details.push_str(&format!(" See message <msg:{bounce_id}>"));
                }
                return self
                    .conclude(queued, message, NewDelivery::new(DeliveryStatus::HardFail, details))
                    .await;
            }
            RouteMode::Endpoint(RouteEndpoint::Unsupported(kind)) => {
                warn!(route = route.id, kind = %kind, "Route points at an endpoint that cannot be delivered to");
                return self
                    .conclude(queued, message, NewDelivery::new(DeliveryStatus::HardFail, NO_ROUTE))
                    .await;
            }
            RouteMode::Endpoint(RouteEndpoint::Smtp(endpoint)) => {
                let source = self.source_address(queued).await?;
                let servers = vec![endpoint.to_server()];
                let key = SenderKey::Smtp {
                    domain: endpoint.hostname.clone(),
                    ip_address_id: queued.ip_address_id,
                    servers: Some(servers.clone()),
                    rcpt_to: None,
                };
                let settings = self.context.shared_settings();
                let resolver = self.context.shared_resolver();
                let build = move || {
                    Sender::Smtp(Box::new(
                        SmtpSender::new(endpoint.hostname, source, settings, resolver).with_servers(servers),
                    ))
                };
                self.send_with(state, key, build, message, server).await?
            }
            RouteMode::Endpoint(RouteEndpoint::Address(endpoint)) => {
                let source = self.source_address(queued).await?;
                let domain = endpoint.domain().to_string();
                let key = SenderKey::Smtp {
                    domain: domain.clone(),
                    ip_address_id: queued.ip_address_id,
                    servers: None,
                    rcpt_to: Some(endpoint.address.clone()),
                };
                let settings = self.context.shared_settings();
                let resolver = self.context.shared_resolver();
                let build = move || {
                    Sender::Smtp(Box::new(
                        SmtpSender::new(domain, source, settings, resolver).with_rcpt_to(endpoint.address),
                    ))
                };
                self.send_with(state, key, build, message, server).await?
            }
            RouteMode::Endpoint(RouteEndpoint::Http(endpoint)) => {
                let key = SenderKey::Http {
                    endpoint_id: endpoint.id,
                };
                let client = self.context.http().clone();
                let signer = self.context.settings().request_signer.clone();
                let build = move || Sender::Http(HttpSender::new(endpoint, client).with_signer(signer));
                self.send_with(state, key, build, message, server).await?
            }
        };

        let mut bounce = None;
        if result.result_type == ResultType::HardFail
            && !result.suppress_bounce
            && let Some(bounce_id) = store.send_bounce(message.server_id, message.id).await?
        {
            bounce = Some(format!("Sent bounce message to sender (see message <msg:{bounce_id}>)"));
        }

        self.complete(queued, message, &result, bounce.as_deref()).await
    }

    async fn send_with(
        &self,
        state: &mut DispatchState,
        key: SenderKey,
        build: impl FnOnce() -> Sender,
        message: &Message,
        server: &MailServer,
    ) -> Result<SendResult> {
        let sender = state.sender_for(key, build).await?;
        let result = sender.send_message(message, server).await;

        if let Some(metrics) = courier_metrics::metrics() {
            metrics.delivery.record_result(
                sender.kind(),
                result.result_type.as_str(),
                result.time.unwrap_or_default(),
            );
        }

        Ok(result)
    }

    async fn source_address(&self, queued: &QueuedMessage) -> Result<Option<IpAddressRecord>> {
        match queued.ip_address_id {
            Some(id) => self.context.store()?.ip_address(id).await,
            None => Ok(None),
        }
    }

    /// Records a sender's outcome, then reschedules or deletes the row.
    async fn complete(
        &self,
        queued: &QueuedMessage,
        message: &Message,
        result: &SendResult,
        extra_details: Option<&str>,
    ) -> Result<()> {
        let mut details = result.details.clone();
        if let Some(extra) = extra_details {
            if !details.ends_with('.') {
                details.push('.');
            }
            details.push(' ');
            details.push_str(extra);
        }

        let delivery = NewDelivery {
            status: result.result_type.into(),
            details,
            output: result.output.trim().to_string(),
            sent_with_ssl: result.secure,
            log_id: Some(result.log_id.clone()),
            time: result.time,
        };
        info!(
            log_id = %result.log_id,
            status = delivery.status.as_str(),
            "{}",
            delivery.details
        );
        self.context
            .store()?
            .create_delivery(message.server_id, message.id, delivery)
            .await?;

        let repo = self.context.database().queued_messages();
        if result.retry.is_set() {
            let delay = result
                .retry
                .delay_secs()
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(TimeDelta::try_seconds);
            let retry_after = repo.retry_later(queued, delay).await?;
            info!(%retry_after, "Message will be retried");
        } else {
            repo.delete(queued).await?;
        }

        Ok(())
    }

    /// Records a final delivery and deletes the row.
    async fn conclude(&self, queued: &QueuedMessage, message: &Message, delivery: NewDelivery) -> Result<()> {
        info!(status = delivery.status.as_str(), "{}", delivery.details);
        self.context
            .store()?
            .create_delivery(message.server_id, message.id, delivery)
            .await?;
        self.remove(queued).await
    }

    async fn remove(&self, queued: &QueuedMessage) -> Result<()> {
        self.context.database().queued_messages().delete(queued).await?;
        Ok(())
    }

    async fn handle_error(&self, queued: &QueuedMessage, err: &DeliveryError) {
        error!(kind = err.kind(), "Error while processing queued message: {err}");

        if let Some(metrics) = courier_metrics::metrics() {
            metrics.worker.record_error(err.kind());
        }

        if let Err(retry_err) = self
            .context
            .database()
            .queued_messages()
            .retry_later(queued, None)
            .await
        {
            error!("Cannot reschedule queued message: {retry_err}");
        }

        let delivery = NewDelivery::new(DeliveryStatus::Error, INTERNAL_ERROR).with_output(err.to_string());
        let recorded = match self.context.store() {
            Ok(store) => {
                store
                    .create_delivery(queued.server_id, queued.message_id, delivery)
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(store_err) = recorded {
            error!("Cannot record delivery error: {store_err}");
        }
    }
}
