//! An SMTP session with a single remote server.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::{config::SocksProxy, incoming, outgoing};
use tokio::{
    net::{TcpSocket, TcpStream},
    time::timeout,
};
use tokio_socks::tcp::Socks5Stream;

use super::{
    error::{ClientError, Result},
    response::Response,
    tls::Transport,
};

/// Initial size of the read buffer for SMTP replies.
const BUFFER_SIZE: usize = 8192;

/// Upper bound on a single reply, to stop a hostile peer growing the buffer forever.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Where and how to open a session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    address: SocketAddr,
    tls_hostname: String,
    source: Option<IpAddr>,
    proxy: Option<SocksProxy>,
    open_timeout: Duration,
    read_timeout: Duration,
    implicit_tls: bool,
    verify_certificates: bool,
}

impl ConnectOptions {
    /// Options for connecting to `address`, presenting `tls_hostname` as the
    /// TLS server name.
    #[must_use]
    pub fn new(address: SocketAddr, tls_hostname: impl Into<String>) -> Self {
        Self {
            address,
            tls_hostname: tls_hostname.into(),
            source: None,
            proxy: None,
            open_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            implicit_tls: false,
            verify_certificates: false,
        }
    }

    /// Bind the local end of the connection to `source`.
    #[must_use]
    pub const fn source(mut self, source: Option<IpAddr>) -> Self {
        self.source = source;
        self
    }

    /// Tunnel the connection through a SOCKS5 proxy. The proxy chooses the
    /// egress address, so `source` is not bound.
    #[must_use]
    pub fn proxy(mut self, proxy: Option<SocksProxy>) -> Self {
        self.proxy = proxy;
        self
    }

    #[must_use]
    pub const fn timeouts(mut self, open: Duration, read: Duration) -> Self {
        self.open_timeout = open;
        self.read_timeout = read;
        self
    }

    /// Negotiate TLS immediately after connecting instead of via STARTTLS.
    #[must_use]
    pub const fn implicit_tls(mut self, implicit: bool) -> Self {
        self.implicit_tls = implicit;
        self
    }

    #[must_use]
    pub const fn verify_certificates(mut self, verify: bool) -> Self {
        self.verify_certificates = verify;
        self
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }
}

async fn open(options: &ConnectOptions) -> Result<TcpStream> {
    if let Some(proxy) = &options.proxy {
        outgoing!(level = DEBUG, "Connecting to {} through {proxy}", options.address);
        return open_through_proxy(proxy, options.address).await;
    }

    let socket = match options.address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(source) = options.source {
        socket.bind(SocketAddr::new(source, 0))?;
    }
    Ok(socket.connect(options.address).await?)
}

async fn open_through_proxy(proxy: &SocksProxy, target: SocketAddr) -> Result<TcpStream> {
    let address = (proxy.host.as_str(), proxy.port);
    let tunnel = match proxy.credentials() {
        Some((username, password)) => {
            Socks5Stream::connect_with_password(address, target, username, password).await
        }
        None => Socks5Stream::connect(address, target).await,
    }
    .map_err(|err| ClientError::Proxy(format!("{proxy}: {err}")))?;

    Ok(tunnel.into_inner())
}

/// An open SMTP session.
pub struct SmtpClient {
    transport: Option<Transport>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    tls_hostname: String,
    verify_certificates: bool,
    read_timeout: Duration,
    capabilities: Option<Response>,
    error_occurred: bool,
}

impl SmtpClient {
    /// Opens the TCP connection (and TLS, if implicit).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or connected, the proxy
    /// refuses the tunnel, the open timeout elapses, or the implicit TLS
    /// handshake fails.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let stream = timeout(options.open_timeout, open(&options))
            .await
            .map_err(|_| ClientError::Timeout("open"))??;

        let mut transport = Transport::Plain(stream);
        if options.implicit_tls {
            transport = timeout(
                options.open_timeout,
                transport.into_tls(&options.tls_hostname, options.verify_certificates),
            )
            .await
            .map_err(|_| ClientError::Timeout("open"))??;
        }

        Ok(Self {
            transport: Some(transport),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            tls_hostname: options.tls_hostname,
            verify_certificates: options.verify_certificates,
            read_timeout: options.read_timeout,
            capabilities: None,
            error_occurred: false,
        })
    }

    /// Reads the server's 220 greeting.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        let response = self.read_response().await?;
        self.expect_positive(response)
    }

    /// Sends EHLO, falling back to HELO when the server rejects it.
    pub async fn hello(&mut self, name: &str) -> Result<Response> {
        match self.ehlo(name).await {
            Err(ClientError::Reply { .. }) => {
                self.error_occurred = false;
                self.helo(name).await
            }
            other => other,
        }
    }

    pub async fn ehlo(&mut self, name: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {name}")).await?;
        let response = self.expect_positive(response)?;
        self.capabilities = Some(response.clone());
        Ok(response)
    }

    pub async fn helo(&mut self, name: &str) -> Result<Response> {
        let response = self.command(&format!("HELO {name}")).await?;
        self.capabilities = None;
        self.expect_positive(response)
    }

    /// Whether the last EHLO reply advertised `extension`.
    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.capabilities
            .as_ref()
            .is_some_and(|caps| caps.has_extension(extension))
    }

    /// Issues STARTTLS and upgrades the transport.
    ///
    /// The caller must greet again afterwards; the previous capabilities are
    /// discarded.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;
        let response = self.expect_positive(response)?;

        let transport = self.transport.take().ok_or(ClientError::ConnectionClosed)?;
        let upgraded = timeout(
            self.read_timeout,
            transport.into_tls(&self.tls_hostname, self.verify_certificates),
        )
        .await
        .map_err(|_| ClientError::Timeout("read"))??;

        self.transport = Some(upgraded);
        self.capabilities = None;
        self.buffer_pos = 0;
        Ok(response)
    }

    /// Authenticates with `AUTH PLAIN`.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<Response> {
        let token = STANDARD.encode(format!("\0{username}\0{password}"));
        self.send_line(&format!("AUTH PLAIN {token}"), "AUTH PLAIN ****")
            .await?;
        let response = self.read_response().await?;
        self.expect_positive(response)
    }

    /// Runs one MAIL/RCPT/DATA transaction.
    ///
    /// `data` may use bare LF line endings; it is converted to CRLF and
    /// dot-stuffed on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::PendingError`] if an earlier command failed and
    /// the session has not been reset or cleared since.
    pub async fn send_message(&mut self, data: &[u8], from: &str, to: &str) -> Result<Response> {
        if self.error_occurred {
            return Err(ClientError::PendingError);
        }

        let response = self.command(&format!("MAIL FROM:<{from}>")).await?;
        self.expect_positive(response)?;

        let response = self.command(&format!("RCPT TO:<{to}>")).await?;
        self.expect_positive(response)?;

        let response = self.command("DATA").await?;
        self.expect_positive(response)?;

        self.transport_mut()?.send(&encode_data(data)).await?;
        outgoing!("<message data, {} bytes>", data.len());

        let response = self.read_response().await?;
        self.expect_positive(response)
    }

    /// Resets the current transaction and clears any pending error.
    pub async fn rset(&mut self) -> Result<Response> {
        let response = self.command("RSET").await?;
        let response = self.expect_positive(response)?;
        self.error_occurred = false;
        Ok(response)
    }

    /// Forgets a failed earlier command without talking to the server.
    pub const fn clear_error(&mut self) {
        self.error_occurred = false;
    }

    /// Sends QUIT and closes the connection.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await;
        self.close().await;
        response
    }

    /// Closes the connection without QUIT.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await;
        }
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_tls)
    }

    /// Sends a raw command line and reads the reply without judging it.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_line(command, command).await?;
        self.read_response().await
    }

    async fn send_line(&mut self, line: &str, logged: &str) -> Result<()> {
        outgoing!("{logged}");
        let data = format!("{line}\r\n");
        self.transport_mut()?.send(data.as_bytes()).await
    }

    fn transport_mut(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    fn expect_positive(&mut self, response: Response) -> Result<Response> {
        if response.is_positive() {
            Ok(response)
        } else {
            self.error_occurred = true;
            Err(ClientError::from_response(&response))
        }
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.buffer_pos])? {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::Parse(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let read_timeout = self.read_timeout;
            let pos = self.buffer_pos;
            let transport = self.transport.as_mut().ok_or(ClientError::ConnectionClosed)?;
            let n = timeout(read_timeout, transport.read(&mut self.buffer[pos..]))
                .await
                .map_err(|_| ClientError::Timeout("read"))??;
            self.buffer_pos += n;
        }
    }
}

/// Converts message data to CRLF line endings, dot-stuffs it and appends the
/// terminating `.` line.
fn encode_data(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() + data.len() / 32 + 5);
    let body = data.strip_suffix(b"\n").unwrap_or(data);

    if !body.is_empty() {
        for line in body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                encoded.push(b'.');
            }
            encoded.extend_from_slice(line);
            encoded.extend_from_slice(b"\r\n");
        }
    }

    encoded.extend_from_slice(b".\r\n");
    encoded
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_encode_data_normalises_line_endings() {
        assert_eq!(
            encode_data(b"Subject: x\n\nbody\n"),
            b"Subject: x\r\n\r\nbody\r\n.\r\n".to_vec()
        );
        assert_eq!(
            encode_data(b"Subject: x\r\n\r\nbody"),
            b"Subject: x\r\n\r\nbody\r\n.\r\n".to_vec()
        );
    }

    #[test]
    fn test_encode_data_dot_stuffs() {
        assert_eq!(
            encode_data(b"a\r\n.hidden\r\n..two\r\n"),
            b"a\r\n..hidden\r\n...two\r\n.\r\n".to_vec()
        );
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode_data(b""), b".\r\n".to_vec());
    }
}
