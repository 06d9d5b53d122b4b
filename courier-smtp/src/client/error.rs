//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

use super::response::{ReplyClass, Response};

/// Errors that can occur while talking to a remote SMTP server.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// An open or read did not complete in time.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Failed to parse an SMTP reply from the server.
    #[error("Failed to parse SMTP response: {0}")]
    Parse(String),

    /// The server answered with a 4xx or 5xx reply.
    #[error("{code} {message}")]
    Reply { code: u16, message: String },

    /// TLS negotiation failed, or the connection is in the wrong TLS state.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A previous command on this session failed and the session was not reset.
    #[error("Previous command on this session failed")]
    PendingError,

    /// The SOCKS proxy refused or failed to open the tunnel.
    #[error("SOCKS proxy error: {0}")]
    Proxy(String),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// A command was issued before a session was opened.
    #[error("SMTP session has not been started")]
    SessionNotStarted,
}

impl ClientError {
    pub(crate) fn from_response(response: &Response) -> Self {
        Self::Reply {
            code: response.code,
            message: response.message(),
        }
    }

    /// The reply class for errors that carry an SMTP reply.
    #[must_use]
    pub const fn reply_class(&self) -> Option<ReplyClass> {
        match self {
            Self::Reply { code, .. } => Some(ReplyClass::of(*code)),
            _ => None,
        }
    }

    /// Errors after which another attempt later may well succeed.
    ///
    /// Busy, syntax, authentication and unrecognised replies count, as do read
    /// timeouts. Plain 5xx rejections do not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Reply { code, .. } => !matches!(ReplyClass::of(*code), ReplyClass::Fatal),
            Self::Timeout(operation) => *operation == "read",
            _ => false,
        }
    }

    /// A permanent rejection from the server.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.reply_class(), Some(ReplyClass::Fatal))
    }

    /// The peer went away underneath us: reset, broken pipe or EOF.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            Self::ConnectionClosed => true,
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: u16) -> ClientError {
        ClientError::Reply {
            code,
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(reply(421).is_transient());
        assert!(reply(451).is_transient());
        assert!(reply(501).is_transient());
        assert!(reply(535).is_transient());
        assert!(!reply(550).is_transient());
        assert!(reply(550).is_fatal());
        assert!(ClientError::Timeout("read").is_transient());
        assert!(!ClientError::Timeout("open").is_transient());
    }

    #[test]
    fn test_connection_lost() {
        let reset = ClientError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        let pipe = ClientError::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        let refused = ClientError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));

        assert!(reset.is_connection_lost());
        assert!(pipe.is_connection_lost());
        assert!(ClientError::ConnectionClosed.is_connection_lost());
        assert!(!refused.is_connection_lost());
    }

    #[test]
    fn test_reply_display() {
        assert_eq!(reply(550).to_string(), "550 test");
    }
}
