//! Server and endpoint layer over the SMTP protocol client.
//!
//! A [`Server`] is a hostname with connection policy. Resolving it yields
//! [`Endpoint`]s, one per address, each owning at most one live
//! [`SmtpClient`](courier_smtp::SmtpClient) session.

mod endpoint;
mod server;

pub use endpoint::{Endpoint, SessionOptions};
pub use server::{Credentials, DEFAULT_SMTP_PORT, Server};
