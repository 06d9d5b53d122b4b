//! Senders hand one message at a time to its next hop.
//!
//! Every sender follows the same lifecycle: [`Sender::start`] once,
//! [`Sender::send_message`] for each message that can share the session,
//! then [`Sender::finish`], which always runs.

mod http;
mod payload;
mod smtp;

pub use http::{HttpSender, classify as classify_http_status};
pub use payload::{Payload, build as build_payload};
pub use smtp::SmtpSender;

use crate::{
    dns::DnsError,
    model::{MailServer, Message},
    send_result::SendResult,
    smtp_client::Server,
};

/// Identifies a sender by what it was built for, so a batch reuses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SenderKey {
    Smtp {
        domain: String,
        ip_address_id: Option<i64>,
        servers: Option<Vec<Server>>,
        rcpt_to: Option<String>,
    },
    Http {
        endpoint_id: i64,
    },
}

#[derive(Debug)]
pub enum Sender {
    Smtp(Box<SmtpSender>),
    Http(HttpSender),
}

impl Sender {
    /// Opens the initial session. HTTP senders have nothing to open.
    pub async fn start(&mut self) -> Result<(), DnsError> {
        match self {
            Self::Smtp(sender) => sender.start().await.map(|_| ()),
            Self::Http(_) => Ok(()),
        }
    }

    pub async fn send_message(&mut self, message: &Message, server: &MailServer) -> SendResult {
        match self {
            Self::Smtp(sender) => sender.send_message(message, server).await,
            Self::Http(sender) => sender.send_message(message).await,
        }
    }

    pub async fn finish(&mut self) {
        match self {
            Self::Smtp(sender) => sender.finish().await,
            Self::Http(_) => {}
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Smtp(_) => "smtp",
            Self::Http(_) => "http",
        }
    }
}
