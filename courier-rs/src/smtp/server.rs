use crate::config::{ServerConfig, SmtpConfig};
use crate::delivery::{Forwarder, Processor};
use crate::error::{MailError, Result};
use crate::security::{CredentialVerifier, TlsConfig};
use crate::smtp::session::{SecurityMode, SessionContext, SmtpSession, SmtpStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// A bound listener and the security mode of its connections
pub struct ModeListener {
    pub mode: SecurityMode,
    listener: TcpListener,
}

impl ModeListener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// SMTP ingress on up to three ports: forward, STARTTLS and implicit TLS
pub struct MailIngressServer {
    config: SmtpConfig,
    context: Arc<SessionContext>,
}

impl MailIngressServer {
    pub fn new(
        server: &ServerConfig,
        config: SmtpConfig,
        forwarder: Arc<dyn Forwarder>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self::with_security(server, config, forwarder, processor, None, None)
    }

    pub fn with_security(
        server: &ServerConfig,
        config: SmtpConfig,
        forwarder: Arc<dyn Forwarder>,
        processor: Arc<dyn Processor>,
        tls: Option<TlsConfig>,
        verifier: Option<Arc<dyn CredentialVerifier>>,
    ) -> Self {
        let context = Arc::new(SessionContext {
            hostname: server.hostname.clone(),
            max_message_size: config.max_message_size,
            max_recipients: config.max_recipients,
            idle_timeout: config.idle_timeout(),
            enable_auth: config.enable_auth,
            tls,
            verifier,
            forwarder,
            processor,
        });
        Self { config, context }
    }

    /// Bind every enabled listener. The forward listener exists only when
    /// forwarding is enabled; implicit TLS needs a certificate.
    pub async fn bind(&self) -> Result<Vec<ModeListener>> {
        let mut addrs = Vec::new();
        if self.config.enable_forwarding {
            addrs.push((SecurityMode::Forward, &self.config.forward_addr));
        }
        addrs.push((SecurityMode::StartTls, &self.config.starttls_addr));
        if self.context.tls.is_some() {
            addrs.push((SecurityMode::ImplicitTls, &self.config.implicit_tls_addr));
        } else {
            warn!("No TLS certificate configured, implicit TLS listener disabled");
        }

        let mut listeners = Vec::with_capacity(addrs.len());
        for (mode, addr) in addrs {
            let listener = TcpListener::bind(addr).await?;
            info!("SMTP {} listener on {}", mode, listener.local_addr()?);
            listeners.push(ModeListener { mode, listener });
        }
        Ok(listeners)
    }

    pub async fn run(self) -> Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Accept on all listeners concurrently. Returns when any accept loop ends.
    pub async fn serve(self, listeners: Vec<ModeListener>) -> Result<()> {
        let mut tasks = JoinSet::new();
        for listener in listeners {
            tasks.spawn(accept_loop(Arc::clone(&self.context), listener));
        }

        match tasks.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(MailError::SmtpProtocol(format!("Listener task failed: {}", e))),
            None => Ok(()),
        }
    }
}

async fn accept_loop(context: Arc<SessionContext>, listener: ModeListener) -> Result<()> {
    let mode = listener.mode;
    let acceptor = match (mode, &context.tls) {
        (SecurityMode::ImplicitTls, Some(tls)) => Some(tls.acceptor()),
        (SecurityMode::ImplicitTls, None) => {
            return Err(MailError::Tls(
                "Implicit TLS listener without a certificate".to_string(),
            ));
        }
        _ => None,
    };

    loop {
        let (socket, peer) = match listener.listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept {} connection: {}", mode, e);
                continue;
            }
        };
        info!("New SMTP {} connection from {}", mode, peer);

        let context = Arc::clone(&context);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let stream = match acceptor {
                Some(acceptor) => {
                    match timeout(context.idle_timeout, acceptor.accept(socket)).await {
                        Ok(Ok(tls_stream)) => SmtpStream::Tls(Box::new(tls_stream)),
                        Ok(Err(e)) => {
                            warn!("TLS handshake with {} failed: {}", peer, e);
                            return;
                        }
                        Err(_) => {
                            warn!("TLS handshake with {} timed out", peer);
                            return;
                        }
                    }
                }
                None => SmtpStream::Plain(socket),
            };

            if let Err(e) = SmtpSession::new(context, mode, peer).run(stream).await {
                error!("SMTP session with {} failed: {}", peer, e);
            }
        });
    }
}
