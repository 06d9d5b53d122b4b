//! Delivery over SMTP to MX hosts, relays or a forced server.

use std::{
    sync::{Arc, LazyLock},
    time::Instant,
};

use courier_common::config::SslMode;
use courier_smtp::ClientError;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::{
    context::DeliverySettings,
    dkim,
    dns::{DnsError, LookupOptions, Resolve},
    model::{IpAddressRecord, MailServer, Message, MessageScope, RecordStatus},
    send_result::{ResultType, Retry, SendResult, generate_log_id},
    smtp_client::{Endpoint, Server, SessionOptions},
};

static RETRY_SECONDS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(\d+) seconds").ok());
static RETRY_MINUTES: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(\d+) minutes").ok());

/// Margin added to a delay the remote server asked for.
const RETRY_MARGIN_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    /// Index into `endpoints` of the endpoint with the live session.
    Connected(usize),
    Finished,
}

/// Sends messages for one destination domain over a single session.
pub struct SmtpSender {
    domain: String,
    source: Option<IpAddressRecord>,
    /// Servers to use instead of relays or MX lookup.
    servers: Option<Vec<Server>>,
    rcpt_to: Option<String>,
    settings: Arc<DeliverySettings>,
    resolver: Arc<dyn Resolve>,
    /// Every endpoint a connection was attempted to, without repeats.
    endpoints: Vec<Endpoint>,
    connection_errors: Vec<String>,
    state: State,
    log_id: String,
}

impl std::fmt::Debug for SmtpSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSender")
            .field("domain", &self.domain)
            .field("servers", &self.servers)
            .field("rcpt_to", &self.rcpt_to)
            .field("endpoints", &self.endpoints)
            .field("state", &self.state)
            .field("log_id", &self.log_id)
            .finish_non_exhaustive()
    }
}

impl SmtpSender {
    #[must_use]
    pub fn new(
        domain: impl Into<String>,
        source: Option<IpAddressRecord>,
        settings: Arc<DeliverySettings>,
        resolver: Arc<dyn Resolve>,
    ) -> Self {
        Self {
            domain: domain.into(),
            source,
            servers: None,
            rcpt_to: None,
            settings,
            resolver,
            endpoints: Vec::new(),
            connection_errors: Vec::new(),
            state: State::NotStarted,
            log_id: generate_log_id(),
        }
    }

    #[must_use]
    pub fn with_servers(mut self, servers: Vec<Server>) -> Self {
        self.servers = Some(servers);
        self
    }

    /// Deliver to `rcpt_to` rather than each message's own recipient.
    #[must_use]
    pub fn with_rcpt_to(mut self, rcpt_to: impl Into<String>) -> Self {
        self.rcpt_to = Some(rcpt_to.into());
        self
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    #[must_use]
    pub fn connection_errors(&self) -> &[String] {
        &self.connection_errors
    }

    /// Connects to the first reachable endpoint of the candidate servers.
    ///
    /// Returns whether a session was opened. Only DNS timeouts are errors;
    /// every connection failure is recorded for the result instead.
    pub async fn start(&mut self) -> Result<bool, DnsError> {
        let servers = self.candidate_servers().await?;

        for server in servers {
            for endpoint in server.endpoints(self.resolver.as_ref()).await? {
                if let Some(index) = self.connect_to_endpoint(endpoint).await {
                    self.state = State::Connected(index);
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Forced servers, then relays, then MX hosts, then the domain itself.
    async fn candidate_servers(&self) -> Result<Vec<Server>, DnsError> {
        if let Some(servers) = &self.servers {
            return Ok(servers.clone());
        }

        if !self.settings.relays.is_empty() {
            return Ok(self.settings.relays.clone());
        }

        let records = self
            .resolver
            .mx(&self.domain, LookupOptions::raising())
            .await?;
        if records.is_empty() {
            return Ok(vec![Server::new(self.domain.clone())]);
        }

        Ok(records
            .into_iter()
            .map(|record| Server::new(record.exchange))
            .collect())
    }

    async fn connect_to_endpoint(&mut self, endpoint: Endpoint) -> Option<usize> {
        if endpoint.is_ipv6()
            && self
                .source
                .as_ref()
                .is_some_and(|source| source.ipv6.is_none())
        {
            debug!(endpoint = %endpoint.description(), "Skipping IPv6 endpoint, egress address has no IPv6");
            return None;
        }

        let index = if let Some(index) = self
            .endpoints
            .iter()
            .position(|known| known.server() == endpoint.server() && known.ip() == endpoint.ip())
        {
            index
        } else {
            self.endpoints.push(endpoint);
            self.endpoints.len() - 1
        };

        let options = SessionOptions {
            source: self.source.clone(),
            proxy: self.settings.socks_proxy.clone(),
            timeouts: self.settings.timeouts,
            helo_fallback: self.settings.helo_fallback.clone(),
        };

        let mut allow_ssl = true;
        loop {
            let endpoint = self.endpoints.get_mut(index)?;

            match endpoint.start_smtp_session(options.clone(), allow_ssl).await {
                Ok(()) => {
                    info!(log_id = %self.log_id, "Connected to {}", endpoint.description());
                    return Some(index);
                }
                Err(err) => {
                    endpoint.finish_smtp_session().await;

                    if err.is_tls() && allow_ssl && endpoint.server().ssl_mode() == SslMode::Auto {
                        warn!(log_id = %self.log_id, "SSL error ({err}), retrying without SSL");
                        allow_ssl = false;
                        continue;
                    }

                    error!(
                        log_id = %self.log_id,
                        "Cannot connect to {} ({err})",
                        endpoint.description()
                    );
                    let message = err.to_string();
                    if !self.connection_errors.contains(&message) {
                        self.connection_errors.push(message);
                    }
                    return None;
                }
            }
        }
    }

    pub async fn send_message(&mut self, message: &Message, server: &MailServer) -> SendResult {
        let State::Connected(index) = self.state else {
            return self.no_servers_result();
        };

        let mail_from = self.mail_from(message, server);
        let rcpt_to = self
            .rcpt_to
            .clone()
            .unwrap_or_else(|| message.rcpt_to.clone());
        let raw_message = self.prepare_raw_message(message, &mail_from);

        info!(
            log_id = %self.log_id,
            "Sending message {}::{} to {rcpt_to}",
            server.id,
            message.id
        );

        let Some(endpoint) = self.endpoints.get_mut(index) else {
            return self.no_servers_result();
        };

        let started = Instant::now();
        let outcome = endpoint.send_message(&raw_message, &mail_from, &rcpt_to).await;
        let description = endpoint.description();

        let mut result = match outcome {
            Ok(response) => {
                info!(log_id = %self.log_id, "Accepted by {description} for {rcpt_to}");
                let mut details = format!("Message for {rcpt_to} accepted by {description}");
                if let Some(source_ip) = endpoint.source_ip() {
                    details.push_str(&format!(" (from {source_ip})"));
                }
                SendResult::new(ResultType::Sent)
                    .with_details(details)
                    .with_output(format!("{} {}", response.code, response.message()))
            }
            Err(err) => {
                error!(log_id = %self.log_id, "Send to {description} failed: {err}");
                endpoint.reset_smtp_session().await;
                failure_result(&err, &description)
            }
        };

        result.log_id.clone_from(&self.log_id);
        result.secure = endpoint.is_secure();
        result.set_elapsed(started.elapsed());
        result
    }

    /// Closes every session opened during this attempt.
    pub async fn finish(&mut self) {
        for endpoint in &mut self.endpoints {
            endpoint.finish_smtp_session().await;
        }
        self.state = State::Finished;
    }

    fn no_servers_result(&self) -> SendResult {
        let mut details = format!("No SMTP servers were available for {}.", self.domain);
        if self.endpoints.is_empty() {
            details.push_str(" No hosts to try.");
        } else {
            let mut hostnames: Vec<&str> = Vec::new();
            for endpoint in &self.endpoints {
                let hostname = endpoint.server().hostname();
                if !hostnames.contains(&hostname) {
                    hostnames.push(hostname);
                }
            }
            details.push_str(&format!(" Tried {}.", to_sentence(&hostnames)));
        }

        let mut result = SendResult::new(ResultType::SoftFail)
            .with_retry(Retry::Yes)
            .with_details(details)
            .with_output(self.connection_errors.join(", "));
        result.connect_error = true;
        result.log_id.clone_from(&self.log_id);
        result
    }

    /// Bounces go out with a null sender. Otherwise the domain's own return
    /// path is used once it has been verified.
    fn mail_from(&self, message: &Message, server: &MailServer) -> String {
        if message.bounce {
            return String::new();
        }

        match &message.domain {
            Some(domain) if domain.return_path_status == RecordStatus::Ok => format!(
                "{}@{}",
                server.token,
                domain.return_path_domain(&self.settings.custom_return_path_prefix)
            ),
            _ => format!("{}@{}", server.token, self.settings.return_path_domain),
        }
    }

    fn prepare_raw_message(&self, message: &Message, mail_from: &str) -> Vec<u8> {
        let original = message.raw_message.as_deref().unwrap_or_default();
        let mut raw_message = Vec::with_capacity(original.len() + 512);

        if self.settings.use_resent_sender_header {
            raw_message.extend_from_slice(format!("Resent-Sender: {mail_from}\r\n").as_bytes());
        }

        if message.scope == MessageScope::Outgoing {
            match self.dkim_header(message, original) {
                Ok(Some(header)) => {
                    raw_message.extend_from_slice(header.as_bytes());
                    raw_message.extend_from_slice(b"\r\n");
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(log_id = %self.log_id, "Sending message {} unsigned: {err}", message.id);
                }
            }
        }

        raw_message.extend_from_slice(original);
        raw_message
    }

    fn dkim_header(&self, message: &Message, raw: &[u8]) -> Result<Option<String>, dkim::DkimError> {
        let Some(signer) =
            dkim::signer_for(message.domain.as_ref(), self.settings.platform_signer.as_ref())?
        else {
            return Ok(None);
        };

        signer.dkim_header(raw).map(Some)
    }
}

fn failure_result(err: &ClientError, description: &str) -> SendResult {
    if err.is_transient() {
        let text = err.to_string();
        return SendResult::new(ResultType::SoftFail)
            .with_details(format!("Temporary SMTP delivery error when sending to {description}"))
            .with_retry(parse_retry(&text))
            .with_output(text);
    }

    if err.is_fatal() {
        return SendResult::new(ResultType::HardFail)
            .with_details(format!("Permanent SMTP delivery error when sending to {description}"))
            .with_output(err.to_string());
    }

    SendResult::new(ResultType::SoftFail)
        .with_details(format!("An error occurred while sending the message to {description}"))
        .with_retry(Retry::Yes)
        .with_output(err.to_string())
}

/// Honours "N seconds" or "N minutes" in a deferral, plus a margin.
fn parse_retry(text: &str) -> Retry {
    let captured = |pattern: &LazyLock<Option<Regex>>| {
        pattern
            .as_ref()
            .and_then(|regex| regex.captures(text))
            .and_then(|captures| captures[1].parse::<u64>().ok())
    };

    if let Some(seconds) = captured(&RETRY_SECONDS) {
        Retry::After(seconds.saturating_add(RETRY_MARGIN_SECS))
    } else if let Some(minutes) = captured(&RETRY_MINUTES) {
        Retry::After(minutes.saturating_mul(60).saturating_add(RETRY_MARGIN_SECS))
    } else {
        Retry::Yes
    }
}

/// `a`, `a and b`, `a, b and c`.
fn to_sentence(items: &[&str]) -> String {
    match items {
        [] => String::new(),
        [only] => (*only).to_string(),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        model::Domain,
        testing::{self, StaticResolver},
    };

    fn sender(resolver: StaticResolver) -> SmtpSender {
        SmtpSender::new(
            "example.net",
            None,
            Arc::new(DeliverySettings::default()),
            Arc::new(resolver),
        )
    }

    #[test]
    fn test_parse_retry() {
        assert_eq!(parse_retry("451 4.7.1 Try again in 30 seconds"), Retry::After(40));
        assert_eq!(parse_retry("421 Greylisted for 5 minutes"), Retry::After(310));
        assert_eq!(parse_retry("450 Mailbox busy"), Retry::Yes);
    }

    #[test]
    fn test_to_sentence() {
        assert_eq!(to_sentence(&["mx1"]), "mx1");
        assert_eq!(to_sentence(&["mx1", "mx2"]), "mx1 and mx2");
        assert_eq!(to_sentence(&["mx1", "mx2", "mx3"]), "mx1, mx2 and mx3");
    }

    #[test]
    fn test_failure_classification() {
        let busy = ClientError::Reply {
            code: 451,
            message: "4.3.0 Try again in 2 minutes".to_string(),
        };
        let result = failure_result(&busy, "192.0.2.1:25 (mx.example.net)");
        assert_eq!(result.result_type, ResultType::SoftFail);
        assert_eq!(result.retry, Retry::After(130));
        assert_eq!(
            result.details,
            "Temporary SMTP delivery error when sending to 192.0.2.1:25 (mx.example.net)"
        );

        let rejected = ClientError::Reply {
            code: 550,
            message: "5.1.1 No such user".to_string(),
        };
        let result = failure_result(&rejected, "192.0.2.1:25 (mx.example.net)");
        assert_eq!(result.result_type, ResultType::HardFail);
        assert_eq!(result.retry, Retry::No);
        assert_eq!(result.output, "550 5.1.1 No such user");

        let result = failure_result(&ClientError::ConnectionClosed, "192.0.2.1:25 (mx.example.net)");
        assert_eq!(result.result_type, ResultType::SoftFail);
        assert_eq!(result.retry, Retry::Yes);
        assert!(result.details.starts_with("An error occurred while sending"));
    }

    #[test]
    fn test_mail_from_selection() {
        let sender = sender(StaticResolver::default());
        let server = MailServer::new(1, "srvtoken");
        let mut message = testing::message(1, "bob@example.net");

        assert_eq!(sender.mail_from(&message, &server), "srvtoken@rp.courier.example.com");

        let mut domain = Domain::new(1, "example.com");
        domain.return_path_status = RecordStatus::Ok;
        message.domain = Some(domain);
        assert_eq!(sender.mail_from(&message, &server), "srvtoken@psrp.example.com");

        message.bounce = true;
        assert_eq!(sender.mail_from(&message, &server), "");
    }

    #[test]
    fn test_resent_sender_is_prepended() {
        let sender = sender(StaticResolver::default());
        let message = testing::message(1, "bob@example.net");

        let raw = sender.prepare_raw_message(&message, "srvtoken@rp.courier.example.com");
        let raw = String::from_utf8(raw).unwrap();
        assert!(raw.starts_with("Resent-Sender: srvtoken@rp.courier.example.com\r\nFrom: Alice"));
    }

    #[tokio::test]
    async fn test_candidate_servers_fall_back_to_domain() {
        let sender = sender(StaticResolver::default());
        let servers = sender.candidate_servers().await.unwrap();
        assert_eq!(servers, vec![Server::new("example.net")]);

        let sender = self::sender(
            StaticResolver::default().with_mx("example.net", &[(10, "mx1.example.net"), (20, "mx2.example.net")]),
        );
        let servers = sender.candidate_servers().await.unwrap();
        assert_eq!(
            servers,
            vec![Server::new("mx1.example.net"), Server::new("mx2.example.net")]
        );

        let forced = sender.with_servers(vec![Server::new("forced.example.org").with_port(2525)]);
        let servers = forced.candidate_servers().await.unwrap();
        assert_eq!(servers[0].port(), 2525);
    }

    #[tokio::test]
    async fn test_send_without_endpoints() {
        let mut sender = sender(StaticResolver::default());
        assert!(!sender.start().await.unwrap());

        let result = sender
            .send_message(&testing::message(1, "bob@example.net"), &MailServer::new(1, "srvtoken"))
            .await;
        assert_eq!(result.result_type, ResultType::SoftFail);
        assert_eq!(result.retry, Retry::Yes);
        assert!(result.connect_error);
        assert_eq!(
            result.details,
            "No SMTP servers were available for example.net. No hosts to try."
        );

        sender.finish().await;
        assert_eq!(sender.state, State::Finished);
    }
}
