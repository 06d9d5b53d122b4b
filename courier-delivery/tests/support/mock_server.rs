//! Mock SMTP server for delivery scenarios
//!
//! Speaks just enough SMTP for the delivery engine: greeting, EHLO/HELO,
//! MAIL, RCPT, DATA, RSET, NOOP and QUIT. Replies are configurable per
//! command and every command received is recorded.
//!
//! ```rust,no_run
//! # async fn example() -> std::io::Result<()> {
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_to_response(550, "5.1.1 User unknown")
//!     .build()
//!     .await?;
//!
//! // point a Server at 127.0.0.1:server.port()
//! # Ok(())
//! # }
//! ```
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// A command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content between DATA and the terminating dot
    MessageContent(String),
    Rset,
    Noop,
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct Config {
    greeting: Reply,
    capabilities: Vec<String>,
    mail_from: Reply,
    rcpt_to: Reply,
    data_end: Reply,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.test ESMTP"),
            capabilities: vec!["mock.test".to_string(), "SIZE 10000000".to_string()],
            mail_from: Reply::new(250, "OK"),
            rcpt_to: Reply::new(250, "OK"),
            data_end: Reply::new(250, "2.0.0 OK: queued as MOCK1"),
        }
    }
}

impl Config {
    fn ehlo_bytes(&self) -> Vec<u8> {
        let last = self.capabilities.len().saturating_sub(1);
        self.capabilities
            .iter()
            .enumerate()
            .map(|(index, capability)| {
                let separator = if index == last { ' ' } else { '-' };
                format!("250{separator}{capability}\r\n")
            })
            .collect::<String>()
            .into_bytes()
    }
}

/// A running mock server, listening on an ephemeral port on 127.0.0.1
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
    connections: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: Config::default(),
        }
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// Number of connections accepted so far
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<Config>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(&config.greeting.to_bytes()).await?;

        loop {
            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            let command_line = line.trim_end();
            let (verb, argument) = command_line
                .split_once(' ')
                .unwrap_or((command_line, ""));

            let (reply, command) = match verb.to_uppercase().as_str() {
                "EHLO" => (config.ehlo_bytes(), SmtpCommand::Ehlo(argument.to_string())),
                "HELO" => (
                    Reply::new(250, "mock.test").to_bytes(),
                    SmtpCommand::Helo(argument.to_string()),
                ),
                "MAIL" => (config.mail_from.to_bytes(), SmtpCommand::MailFrom(argument.to_string())),
                "RCPT" => (config.rcpt_to.to_bytes(), SmtpCommand::RcptTo(argument.to_string())),
                "DATA" => (Reply::new(354, "End data with <CR><LF>.<CR><LF>").to_bytes(), SmtpCommand::Data),
                "RSET" => (Reply::new(250, "OK").to_bytes(), SmtpCommand::Rset),
                "NOOP" => (Reply::new(250, "OK").to_bytes(), SmtpCommand::Noop),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(&Reply::new(221, "Bye").to_bytes()).await?;
                    return Ok(());
                }
                _ => (
                    Reply::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(command_line.to_string()),
                ),
            };

            let is_data = command == SmtpCommand::Data;
            commands.write().await.push(command);
            writer.write_all(&reply).await?;

            if is_data {
                let mut content = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line == ".\r\n" || line == ".\n" {
                        break;
                    }
                    content.push_str(&line);
                }
                commands.write().await.push(SmtpCommand::MessageContent(content));
                writer.write_all(&config.data_end.to_bytes()).await?;
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    config: Config,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.config.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to = Reply::new(code, message);
        self
    }

    /// The reply after the terminating dot
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end = Reply::new(code, message);
        self
    }

    /// Binds and starts serving in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if no local port can be bound.
    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let server_commands = Arc::clone(&commands);
        let server_connections = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                server_connections.fetch_add(1, Ordering::SeqCst);
                let config = Arc::clone(&config);
                let commands = Arc::clone(&server_commands);
                tokio::spawn(async move {
                    if let Err(err) = MockSmtpServer::handle_client(stream, config, commands).await {
                        tracing::debug!("Mock server client error: {err}");
                    }
                });
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands,
            connections,
        })
    }
}

/// A port on 127.0.0.1 with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
