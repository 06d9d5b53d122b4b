use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use courier_common::{
    config::{SmtpClientTimeouts, SocksProxy, SslMode},
    internal,
};
use courier_smtp::{ClientError, ConnectOptions, Response, SmtpClient};

use super::{Credentials, Server};
use crate::model::IpAddressRecord;

/// How a session is opened: egress address, proxy, timeouts and the HELO
/// name used when there is no egress address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub source: Option<IpAddressRecord>,
    /// Used when the egress address has no proxy of its own.
    pub proxy: Option<SocksProxy>,
    pub timeouts: SmtpClientTimeouts,
    pub helo_fallback: String,
}

impl SessionOptions {
    /// The egress address's reverse DNS name, or the fallback.
    #[must_use]
    pub fn helo_hostname(&self) -> &str {
        self.source
            .as_ref()
            .map_or(self.helo_fallback.as_str(), |source| source.hostname.as_str())
    }

    /// The egress address's proxy, then the global one.
    #[must_use]
    pub fn proxy(&self) -> Option<&SocksProxy> {
        self.source
            .as_ref()
            .and_then(|source| source.proxy.as_ref())
            .or(self.proxy.as_ref())
    }
}

/// One resolved address of a [`Server`], owning at most one live session.
pub struct Endpoint {
    server: Server,
    ip: IpAddr,
    session: Option<SmtpClient>,
    options: Option<SessionOptions>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("server", &self.server)
            .field("ip", &self.ip)
            .field("connected", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    #[must_use]
    pub const fn new(server: Server, ip: IpAddr) -> Self {
        Self {
            server,
            ip,
            session: None,
            options: None,
        }
    }

    #[must_use]
    pub const fn server(&self) -> &Server {
        &self.server
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.ip
    }

    #[must_use]
    pub const fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    /// `{ip}:{port} ({hostname})`
    #[must_use]
    pub fn description(&self) -> String {
        format!("{}:{} ({})", self.ip, self.server.port(), self.server.hostname())
    }

    #[must_use]
    pub const fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the live session is encrypted.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.session.as_ref().is_some_and(SmtpClient::is_tls)
    }

    /// The egress address bound for this endpoint's family, if any.
    #[must_use]
    pub fn source_ip(&self) -> Option<IpAddr> {
        let source = self.options.as_ref()?.source.as_ref()?;
        if self.is_ipv6() {
            source.ipv6.map(IpAddr::V6)
        } else {
            Some(IpAddr::V4(source.ipv4))
        }
    }

    /// Connects, greets and applies the server's TLS and auth settings.
    ///
    /// With `allow_ssl` false the session stays in plaintext whatever the
    /// server's policy. On failure nothing is left open.
    pub async fn start_smtp_session(
        &mut self,
        options: SessionOptions,
        allow_ssl: bool,
    ) -> Result<(), ClientError> {
        self.finish_smtp_session().await;
        self.options = Some(options);

        let ssl_mode = if allow_ssl {
            self.server.ssl_mode()
        } else {
            SslMode::None
        };

        let Some(options) = self.options.as_ref() else {
            return Err(ClientError::SessionNotStarted);
        };
        let helo = options.helo_hostname().to_string();
        let connect = ConnectOptions::new(
            SocketAddr::new(self.ip, self.server.port()),
            self.server.hostname(),
        )
        .source(self.source_ip())
        .proxy(options.proxy().cloned())
        .timeouts(options.timeouts.open_timeout(), options.timeouts.read_timeout())
        .implicit_tls(ssl_mode == SslMode::Tls)
        .verify_certificates(self.server.ssl_mode().verifies_certificates());

        internal!(
            level = DEBUG,
            "Connecting to {} (ssl mode {ssl_mode}, helo {helo})",
            self.description()
        );

        let mut client = SmtpClient::connect(connect).await?;
        match handshake(&mut client, ssl_mode, &helo, self.server.credentials()).await {
            Ok(()) => {
                self.session = Some(client);
                Ok(())
            }
            Err(err) => {
                client.close().await;
                Err(err)
            }
        }
    }

    /// Sends one message over the live session.
    ///
    /// A dropped connection or TLS failure gets one reconnect and resend.
    pub async fn send_message(
        &mut self,
        raw_message: &[u8],
        mail_from: &str,
        rcpt_to: &str,
    ) -> Result<Response, ClientError> {
        let client = self.session.as_mut().ok_or(ClientError::SessionNotStarted)?;
        client.clear_error();

        let result = client.send_message(raw_message, mail_from, rcpt_to).await;
        match result {
            Err(err) if err.is_connection_lost() || err.is_tls() => {
                internal!(
                    level = INFO,
                    "Lost connection to {} ({err}), reconnecting",
                    self.description()
                );

                let options = self.options.clone().ok_or(ClientError::SessionNotStarted)?;
                self.start_smtp_session(options, true).await?;

                let client = self.session.as_mut().ok_or(ClientError::SessionNotStarted)?;
                client.send_message(raw_message, mail_from, rcpt_to).await
            }
            other => other,
        }
    }

    /// RSET, or tear the session down if that fails.
    pub async fn reset_smtp_session(&mut self) {
        let failed = match self.session.as_mut() {
            Some(client) => client.rset().await.is_err(),
            None => false,
        };

        if failed {
            self.finish_smtp_session().await;
        }
    }

    /// QUIT and close. Errors are ignored.
    pub async fn finish_smtp_session(&mut self) {
        if let Some(mut client) = self.session.take() {
            let _ = client.quit().await;
        }
    }
}

async fn handshake(
    client: &mut SmtpClient,
    ssl_mode: SslMode,
    helo: &str,
    credentials: Option<&Credentials>,
) -> Result<(), ClientError> {
    client.read_greeting().await?;
    client.hello(helo).await?;

    let upgrade = match ssl_mode {
        SslMode::Auto => client.supports("STARTTLS"),
        SslMode::StartTls => true,
        SslMode::Tls | SslMode::None => false,
    };
    if upgrade {
        client.starttls().await?;
        client.hello(helo).await?;
    }

    if let Some(credentials) = credentials {
        client
            .auth_plain(&credentials.username, &credentials.password)
            .await?;
    }

    Ok(())
}
