//! IMAP listener
//!
//! Accepts TCP connections (optionally wrapped in TLS from the first byte) and
//! drives one [`ImapSession`] per connection. Bytes are fed to a
//! [`Receiver`] as they arrive; the loop never assumes one read is one command.

use crate::config::ImapConfig;
use crate::error::Result;
use crate::imap::receiver::{Receiver, ReceiverError, Request};
use crate::imap::response::Response;
use crate::imap::session::{ImapSession, SessionState};
use crate::imap::store::{EmailStore, MailboxStore};
use crate::security::{CredentialVerifier, TlsConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// IMAP server
pub struct ImapServer {
    config: ImapConfig,
    mailboxes: Arc<dyn MailboxStore>,
    emails: Arc<dyn EmailStore>,
    verifier: Arc<dyn CredentialVerifier>,
    tls: Option<TlsConfig>,
}

impl ImapServer {
    pub fn new(
        config: ImapConfig,
        mailboxes: Arc<dyn MailboxStore>,
        emails: Arc<dyn EmailStore>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            config,
            mailboxes,
            emails,
            verifier,
            tls: None,
        }
    }

    /// TLS settings used when `implicit_tls` is enabled
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!(
            "IMAP server listening on {} (implicit TLS: {})",
            listener.local_addr()?,
            self.config.implicit_tls
        );
        Ok(listener)
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let acceptor = match (&self.tls, self.config.implicit_tls) {
            (Some(tls), true) => Some(tls.acceptor()),
            (None, true) => {
                warn!("IMAP implicit TLS requested but no certificate is configured, serving plaintext");
                None
            }
            _ => None,
        };
        let server = Arc::new(self);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept IMAP connection: {}", e);
                    continue;
                }
            };
            info!("New IMAP connection from {}", peer_addr);

            let server = Arc::clone(&server);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => {
                        match timeout(server.idle_timeout(), acceptor.accept(stream)).await {
                            Ok(Ok(tls_stream)) => {
                                server.handle_connection(tls_stream, peer_addr).await
                            }
                            Ok(Err(e)) => {
                                warn!("TLS handshake with {} failed: {}", peer_addr, e);
                                return;
                            }
                            Err(_) => {
                                warn!("TLS handshake with {} timed out", peer_addr);
                                return;
                            }
                        }
                    }
                    None => server.handle_connection(stream, peer_addr).await,
                };
                if let Err(e) = result {
                    error!("Error handling IMAP connection from {}: {}", peer_addr, e);
                }
            });
        }
    }

    fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout()
    }

    async fn handle_connection<S>(&self, mut stream: S, peer_addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = ImapSession::new(
            Arc::clone(&self.mailboxes),
            Arc::clone(&self.emails),
            Arc::clone(&self.verifier),
        );
        let connection = session.connection_id().to_string();
        let mut receiver = Receiver::new(self.config.max_literal_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        write_response(&mut stream, &session.greeting()).await?;

        'connection: loop {
            let n = match timeout(self.idle_timeout(), stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    debug!(connection = %connection, "Client closed the connection");
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!(connection = %connection, "Read error: {}", e);
                    break;
                }
                Err(_) => {
                    info!(connection = %connection, "Idle timeout, closing connection");
                    stream
                        .write_all(b"* BYE Idle timeout, closing connection\r\n")
                        .await?;
                    break;
                }
            };

            let mut bytes = buf[..n].iter();
            loop {
                let response = match receiver.parse(&mut bytes) {
                    Ok(Request::Command(command)) => {
                        debug!(
                            connection = %connection,
                            tag = %command.tag,
                            verb = %command.verb,
                            uid = command.uid,
                            "Received command"
                        );
                        session.handle(command).await
                    }
                    Ok(Request::ContinuationLine(line)) => session.handle_continuation(&line).await,
                    Err(ReceiverError::NeedsMoreData) => break,
                    Err(ReceiverError::NeedsLiteral { size }) => {
                        debug!(connection = %connection, "Waiting for {} byte literal", size);
                        let mut response = Response::new();
                        response.continuation("Ready for literal data");
                        response
                    }
                    Err(ReceiverError::Malformed { tag, message }) => {
                        debug!(connection = %connection, "Malformed command: {}", message);
                        let mut response = Response::new();
                        match tag {
                            Some(tag) => response.bad(&tag, &message),
                            None => response.untagged(format!("BAD {}", message)),
                        };
                        response
                    }
                };

                // A session-level continuation (SASL) is answered by a raw line
                if response.is_continuation() && receiver.is_idle() {
                    receiver.expect_continuation_line();
                }
                write_response(&mut stream, &response).await?;

                if session.state() == SessionState::LoggedOut {
                    break 'connection;
                }
            }
        }

        info!(connection = %connection, "IMAP connection from {} closed", peer_addr);
        Ok(())
    }
}

async fn write_response<S>(stream: &mut S, response: &Response) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
