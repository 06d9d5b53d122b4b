//! SMTP client session.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use courier_smtp::client::{ConnectOptions, SmtpClient};
//!
//! # async fn example() -> Result<(), courier_smtp::ClientError> {
//! let options = ConnectOptions::new("192.0.2.10:25".parse().unwrap(), "mx.example.com")
//!     .timeouts(Duration::from_secs(30), Duration::from_secs(30));
//!
//! let mut client = SmtpClient::connect(options).await?;
//! client.read_greeting().await?;
//! client.ehlo("mta.example.net").await?;
//! client
//!     .send_message(b"Subject: Hi\r\n\r\nHello\r\n", "a@example.net", "b@example.com")
//!     .await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod response;
mod smtp_client;
mod tls;

pub use error::{ClientError, Result};
pub use response::{ReplyClass, Response};
pub use smtp_client::{ConnectOptions, SmtpClient};
