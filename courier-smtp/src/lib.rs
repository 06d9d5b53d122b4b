//! Outbound SMTP client.
//!
//! The client speaks just enough ESMTP to hand a message to a remote mail
//! server: greeting, EHLO/HELO, STARTTLS or implicit TLS, AUTH PLAIN,
//! MAIL/RCPT/DATA, RSET and QUIT. Every read is bounded by a timeout and the
//! outbound socket can be bound to a specific egress address.

pub mod client;

pub use client::{ClientError, ConnectOptions, ReplyClass, Response, SmtpClient};
