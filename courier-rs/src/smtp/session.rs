//! SMTP connection handler
//!
//! Reads CRLF lines into a buffer owned by the session, separate from the
//! transport. STARTTLS swaps the transport in place and empties that buffer,
//! so nothing the client pipelined in plaintext is replayed after the
//! handshake.

use crate::delivery::{Forwarder, Processor};
use crate::error::{MailError, Result};
use crate::security::auth::{
    decode_login_credential, decode_plain_auth, AuthMechanism, CredentialVerifier,
};
use crate::security::TlsConfig;
use crate::smtp::commands::SmtpCommand;
use crate::smtp::transaction::{Envelope, Reply, SmtpTransaction, TransactionState};
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

/// Maximum line length in SMTP protocol (RFC 5321), including CRLF
const MAX_LINE_LENGTH: usize = 1000;

/// Maximum number of failed commands before disconnecting
const MAX_ERRORS: usize = 10;

const READ_CHUNK_SIZE: usize = 4096;

/// Transport security of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Plaintext, messages are relayed outbound
    Forward,
    /// Plaintext until the client issues STARTTLS
    StartTls,
    /// TLS from the first byte
    ImplicitTls,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecurityMode::Forward => "forward",
            SecurityMode::StartTls => "starttls",
            SecurityMode::ImplicitTls => "implicit-tls",
        })
    }
}

/// Settings and collaborators shared by every connection of a server
pub struct SessionContext {
    pub hostname: String,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub idle_timeout: Duration,
    pub enable_auth: bool,
    pub tls: Option<TlsConfig>,
    pub verifier: Option<Arc<dyn CredentialVerifier>>,
    pub forwarder: Arc<dyn Forwarder>,
    pub processor: Arc<dyn Processor>,
}

/// Plain TCP or TLS, so STARTTLS can replace the transport mid-session
pub enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(&mut **stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(&mut **stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(&mut **stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(&mut **stream).poll_shutdown(cx),
        }
    }
}

enum Line {
    Complete(Vec<u8>),
    TooLong,
}

/// Line framing over a connection-owned buffer
#[derive(Default)]
struct LineReader {
    buf: Vec<u8>,
    /// Dropping the rest of an over-long line
    skipping: bool,
}

impl LineReader {
    /// `None` at end of stream
    async fn read_line<S>(&mut self, stream: &mut S) -> std::io::Result<Option<Line>>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                if std::mem::take(&mut self.skipping) || line.len() > MAX_LINE_LENGTH {
                    return Ok(Some(Line::TooLong));
                }
                return Ok(Some(Line::Complete(line)));
            }
            if self.buf.len() > MAX_LINE_LENGTH {
                self.buf.clear();
                self.skipping = true;
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Drop everything buffered, returning how many bytes were dropped
    fn discard(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        self.skipping = false;
        dropped
    }
}

enum Flow {
    Continue,
    StartTls,
    Close,
}

enum Credentials {
    Decoded(String, String),
    Rejected(Reply),
    Disconnected,
}

/// One SMTP connection
pub struct SmtpSession {
    context: Arc<SessionContext>,
    mode: SecurityMode,
    peer: SocketAddr,
    transaction: SmtpTransaction,
    reader: LineReader,
    secure: bool,
    errors: usize,
}

impl SmtpSession {
    pub fn new(context: Arc<SessionContext>, mode: SecurityMode, peer: SocketAddr) -> Self {
        let transaction = SmtpTransaction::new(context.max_recipients, context.max_message_size);
        Self {
            context,
            mode,
            peer,
            transaction,
            reader: LineReader::default(),
            secure: false,
            errors: 0,
        }
    }

    pub async fn run(mut self, mut stream: SmtpStream) -> Result<()> {
        self.secure = matches!(stream, SmtpStream::Tls(_));
        let greeting = Reply::new(220, format!("{} ESMTP Service Ready", self.context.hostname));
        self.send(&mut stream, &greeting).await?;

        loop {
            if self.errors >= MAX_ERRORS {
                warn!(peer = %self.peer, "Too many errors, disconnecting");
                let reply = Reply::new(421, "4.7.0 Too many errors, closing connection");
                self.send(&mut stream, &reply).await?;
                break;
            }

            let Some(line) = self.next_line(&mut stream).await? else {
                break;
            };
            match self.handle_line(&mut stream, line).await? {
                Flow::Continue => {}
                Flow::Close => break,
                Flow::StartTls => match self.upgrade(stream).await? {
                    Some(upgraded) => stream = upgraded,
                    None => return Ok(()),
                },
            }
        }

        debug!(peer = %self.peer, "SMTP session ended");
        Ok(())
    }

    async fn send(&self, stream: &mut SmtpStream, reply: &Reply) -> Result<()> {
        stream.write_all(reply.to_string().as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Send a command reply, counting failures against the error budget
    async fn reply(&mut self, stream: &mut SmtpStream, reply: Reply) -> Result<Flow> {
        if reply.is_error() {
            self.errors += 1;
        }
        self.send(stream, &reply).await?;
        Ok(Flow::Continue)
    }

    /// `None` when the client went away or idled out
    async fn next_line(&mut self, stream: &mut SmtpStream) -> Result<Option<Line>> {
        match timeout(self.context.idle_timeout, self.reader.read_line(stream)).await {
            Ok(Ok(None)) => {
                debug!(peer = %self.peer, "Client disconnected");
                Ok(None)
            }
            Ok(Ok(line)) => Ok(line),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                info!(peer = %self.peer, "Idle timeout, disconnecting");
                let reply = Reply::new(
                    421,
                    format!("4.4.2 {} Idle timeout, closing connection", self.context.hostname),
                );
                // The peer may already be gone
                let _ = self.send(stream, &reply).await;
                Ok(None)
            }
        }
    }

    async fn handle_line(&mut self, stream: &mut SmtpStream, line: Line) -> Result<Flow> {
        let raw = match line {
            Line::Complete(raw) => raw,
            Line::TooLong => {
                warn!(peer = %self.peer, "Command line too long");
                return self.reply(stream, Reply::new(500, "5.5.2 Line too long")).await;
            }
        };
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim_end_matches(['\r', '\n']);
        debug!(peer = %self.peer, mode = %self.mode, "Received: {}", text);

        let command = match SmtpCommand::parse(text) {
            Ok(command) => command,
            Err(e) => {
                return self
                    .reply(stream, Reply::new(501, format!("5.5.2 {}", e)))
                    .await;
            }
        };

        let reply = match command {
            SmtpCommand::Helo(domain) => {
                info!(peer = %self.peer, "HELO from {}", domain);
                self.transaction.greet(&domain);
                self.transaction.set_tls_offered(false);
                Reply::new(250, format!("{} Hello {}", self.context.hostname, domain))
            }
            SmtpCommand::Ehlo(domain) => {
                info!(peer = %self.peer, "EHLO from {}", domain);
                self.transaction.greet(&domain);
                self.ehlo_reply(&domain)
            }
            SmtpCommand::MailFrom(sender) => self.transaction.mail_from(sender),
            SmtpCommand::RcptTo(recipient) => self.transaction.rcpt_to(recipient),
            SmtpCommand::Data => {
                let reply = self.transaction.start_data();
                if !self.transaction.in_data_mode() {
                    return self.reply(stream, reply).await;
                }
                self.send(stream, &reply).await?;
                return self.receive_data(stream).await;
            }
            SmtpCommand::Rset => self.transaction.rset(),
            SmtpCommand::Noop => Reply::new(250, "2.0.0 OK"),
            SmtpCommand::Quit => {
                let reply = Reply::new(
                    221,
                    format!("2.0.0 {} closing connection", self.context.hostname),
                );
                self.send(stream, &reply).await?;
                return Ok(Flow::Close);
            }
            SmtpCommand::Starttls => return self.starttls(stream).await,
            SmtpCommand::Auth(mechanism, initial) => {
                return self.authenticate(stream, &mechanism, initial).await;
            }
            SmtpCommand::Unknown(verb) => {
                debug!(peer = %self.peer, "Unknown command: {}", verb);
                Reply::new(502, "5.5.1 Command not implemented")
            }
        };
        self.reply(stream, reply).await
    }

    fn auth_available(&self) -> bool {
        self.context.enable_auth
            && self.context.verifier.is_some()
            && (self.secure || self.mode != SecurityMode::StartTls)
    }

    fn ehlo_reply(&mut self, domain: &str) -> Reply {
        let mut lines = vec![
            format!("{} Hello {}", self.context.hostname, domain),
            format!("SIZE {}", self.context.max_message_size),
            "8BITMIME".to_string(),
        ];
        if self.auth_available() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }

        let offer_tls = self.mode == SecurityMode::StartTls
            && !self.transaction.tls_upgraded()
            && self.context.tls.is_some();
        self.transaction.set_tls_offered(offer_tls);
        if offer_tls {
            lines.push("STARTTLS".to_string());
        }
        Reply::multiline(250, lines)
    }

    async fn starttls(&mut self, stream: &mut SmtpStream) -> Result<Flow> {
        if self.mode != SecurityMode::StartTls || self.context.tls.is_none() {
            return self
                .reply(stream, Reply::new(502, "5.5.1 STARTTLS not available"))
                .await;
        }
        if self.transaction.tls_upgraded() {
            return self
                .reply(stream, Reply::new(503, "5.5.1 Already using TLS"))
                .await;
        }
        if !self.transaction.tls_offered() {
            return self
                .reply(stream, Reply::new(503, "5.5.1 Send EHLO first"))
                .await;
        }

        info!(peer = %self.peer, "STARTTLS: initiating TLS upgrade");
        self.send(stream, &Reply::new(220, "Ready to start TLS")).await?;
        Ok(Flow::StartTls)
    }

    /// Run the TLS handshake on the existing socket. `None` closes the connection.
    async fn upgrade(&mut self, stream: SmtpStream) -> Result<Option<SmtpStream>> {
        let dropped = self.reader.discard();
        if dropped > 0 {
            warn!(
                peer = %self.peer,
                "Discarding {} bytes received before the TLS handshake",
                dropped
            );
        }

        let Some(tls) = &self.context.tls else {
            return Ok(None);
        };
        let tcp = match stream {
            SmtpStream::Plain(tcp) => tcp,
            SmtpStream::Tls(_) => {
                return Err(MailError::Tls("Connection is already encrypted".to_string()));
            }
        };

        match timeout(self.context.idle_timeout, tls.acceptor().accept(tcp)).await {
            Ok(Ok(tls_stream)) => {
                self.transaction.reset_after_starttls();
                self.secure = true;
                info!(peer = %self.peer, "STARTTLS: TLS upgrade completed");
                Ok(Some(SmtpStream::Tls(Box::new(tls_stream))))
            }
            Ok(Err(e)) => {
                warn!(peer = %self.peer, "TLS handshake failed: {}", e);
                Ok(None)
            }
            Err(_) => {
                warn!(peer = %self.peer, "TLS handshake timed out");
                Ok(None)
            }
        }
    }

    async fn receive_data(&mut self, stream: &mut SmtpStream) -> Result<Flow> {
        loop {
            let Some(line) = self.next_line(stream).await? else {
                self.transaction.abort();
                return Ok(Flow::Close);
            };
            let ended = match line {
                Line::Complete(raw) => self.transaction.push_data_line(&raw),
                Line::TooLong => {
                    self.transaction.reject_long_line();
                    false
                }
            };
            if ended {
                break;
            }
        }

        let reply = match self.transaction.take_message() {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(reply) => {
                warn!(peer = %self.peer, "Message refused: {}", reply.lines.join(" "));
                reply
            }
        };
        self.reply(stream, reply).await
    }

    async fn dispatch(&self, envelope: Envelope) -> Reply {
        info!(
            peer = %self.peer,
            mode = %self.mode,
            helo = self.transaction.helo().unwrap_or("-"),
            "Message from {} for {} recipient(s), {} bytes",
            envelope.sender,
            envelope.recipients.len(),
            envelope.data.len()
        );

        let result = match self.mode {
            SecurityMode::Forward => {
                self.context
                    .forwarder
                    .forward_email(&envelope.sender, &envelope.recipients, &envelope.data)
                    .await
            }
            SecurityMode::StartTls | SecurityMode::ImplicitTls => {
                self.context
                    .processor
                    .process_email(&envelope.sender, &envelope.recipients, &envelope.data)
                    .await
            }
        };

        match result {
            Ok(()) => Reply::new(250, "2.0.0 Message accepted for delivery"),
            Err(e) => {
                error!(peer = %self.peer, "Delivery failed: {}", e);
                Reply::new(550, format!("5.0.0 Message rejected: {}", e))
            }
        }
    }

    async fn authenticate(
        &mut self,
        stream: &mut SmtpStream,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<Flow> {
        let verifier = match &self.context.verifier {
            Some(verifier) if self.context.enable_auth => Arc::clone(verifier),
            _ => {
                return self
                    .reply(stream, Reply::new(502, "5.5.1 AUTH not available"))
                    .await;
            }
        };
        if self.mode == SecurityMode::StartTls && !self.secure {
            return self
                .reply(stream, Reply::new(530, "5.7.0 Must issue a STARTTLS command first"))
                .await;
        }
        if self.transaction.authenticated().is_some() {
            return self
                .reply(stream, Reply::new(503, "5.5.1 Already authenticated"))
                .await;
        }
        if self.transaction.state() != TransactionState::Ready {
            return self
                .reply(stream, Reply::new(503, "5.5.1 Bad sequence of commands"))
                .await;
        }
        let Some(mechanism) = AuthMechanism::parse(mechanism) else {
            return self
                .reply(
                    stream,
                    Reply::new(504, "5.5.4 Authentication mechanism not supported"),
                )
                .await;
        };

        info!(peer = %self.peer, "AUTH {} initiated", mechanism.as_str());
        let (username, password) = match self.read_credentials(stream, mechanism, initial).await? {
            Credentials::Decoded(username, password) => (username, password),
            Credentials::Rejected(reply) => return self.reply(stream, reply).await,
            Credentials::Disconnected => return Ok(Flow::Close),
        };

        let reply = match verifier.verify(&username, &password).await {
            Ok(true) => {
                info!(peer = %self.peer, "Authentication successful for {}", username);
                self.transaction.set_authenticated(username);
                Reply::new(235, "2.7.0 Authentication successful")
            }
            Ok(false) => {
                warn!(peer = %self.peer, "Authentication failed for {}", username);
                Reply::new(535, "5.7.8 Authentication credentials invalid")
            }
            Err(e) => {
                error!(peer = %self.peer, "Credential check failed: {}", e);
                Reply::new(454, "4.7.0 Temporary authentication failure")
            }
        };
        self.reply(stream, reply).await
    }

    async fn read_credentials(
        &mut self,
        stream: &mut SmtpStream,
        mechanism: AuthMechanism,
        initial: Option<String>,
    ) -> Result<Credentials> {
        match mechanism {
            AuthMechanism::Plain => {
                let data = match initial {
                    Some(data) => data,
                    None => match self.challenge(stream, "").await? {
                        Ok(data) => data,
                        Err(outcome) => return Ok(outcome),
                    },
                };
                Ok(match decode_plain_auth(&data) {
                    Ok((username, password)) => Credentials::Decoded(username, password),
                    Err(e) => Credentials::Rejected(Reply::new(501, format!("5.5.2 {}", e))),
                })
            }
            AuthMechanism::Login => {
                // "Username:" and "Password:" in base64
                let username = match self.challenge(stream, "VXNlcm5hbWU6").await? {
                    Ok(data) => data,
                    Err(outcome) => return Ok(outcome),
                };
                let password = match self.challenge(stream, "UGFzc3dvcmQ6").await? {
                    Ok(data) => data,
                    Err(outcome) => return Ok(outcome),
                };
                let decoded = decode_login_credential(&username)
                    .and_then(|username| Ok((username, decode_login_credential(&password)?)));
                Ok(match decoded {
                    Ok((username, password)) => Credentials::Decoded(username, password),
                    Err(e) => Credentials::Rejected(Reply::new(501, format!("5.5.2 {}", e))),
                })
            }
        }
    }

    /// Send a `334` challenge and read the answer line
    async fn challenge(
        &mut self,
        stream: &mut SmtpStream,
        text: &str,
    ) -> Result<std::result::Result<String, Credentials>> {
        self.send(stream, &Reply::new(334, text)).await?;

        let answer = match self.next_line(stream).await? {
            Some(Line::Complete(raw)) => String::from_utf8_lossy(&raw).trim().to_string(),
            Some(Line::TooLong) => {
                return Ok(Err(Credentials::Rejected(Reply::new(
                    500,
                    "5.5.2 Line too long",
                ))));
            }
            None => return Ok(Err(Credentials::Disconnected)),
        };

        if answer == "*" {
            return Ok(Err(Credentials::Rejected(Reply::new(
                501,
                "5.7.0 Authentication cancelled",
            ))));
        }
        Ok(Ok(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all_lines(input: &[u8]) -> Vec<Option<bool>> {
        let mut reader = LineReader::default();
        let mut stream = input;
        let mut lines = Vec::new();
        loop {
            match reader.read_line(&mut stream).await.unwrap() {
                Some(Line::Complete(_)) => lines.push(Some(true)),
                Some(Line::TooLong) => lines.push(Some(false)),
                None => break,
            }
        }
        lines
    }

    #[tokio::test]
    async fn test_line_reader_framing() {
        let mut reader = LineReader::default();
        let mut stream: &[u8] = b"EHLO a\r\nMAIL FROM:<x@y>\r\npartial";

        match reader.read_line(&mut stream).await.unwrap() {
            Some(Line::Complete(line)) => assert_eq!(line, b"EHLO a\r\n"),
            _ => panic!("expected a line"),
        }
        // The second command is already buffered and can be thrown away
        assert_eq!(reader.discard(), b"MAIL FROM:<x@y>\r\npartial".len());
        assert!(reader.read_line(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_reader_rejects_long_lines() {
        let mut input = vec![b'a'; MAX_LINE_LENGTH * 3];
        input.extend_from_slice(b"\r\nNOOP\r\n");
        assert_eq!(read_all_lines(&input).await, vec![Some(false), Some(true)]);

        let mut exact = vec![b'a'; MAX_LINE_LENGTH - 2];
        exact.extend_from_slice(b"\r\n");
        assert_eq!(read_all_lines(&exact).await, vec![Some(true)]);
    }

    #[test]
    fn test_security_mode_names() {
        assert_eq!(SecurityMode::Forward.to_string(), "forward");
        assert_eq!(SecurityMode::StartTls.to_string(), "starttls");
        assert_eq!(SecurityMode::ImplicitTls.to_string(), "implicit-tls");
    }
}
