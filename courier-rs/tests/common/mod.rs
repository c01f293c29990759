//! Shared helpers for the SMTP integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use courier_rs::config::Config;
use courier_rs::delivery::{Forwarder, Processor};
use courier_rs::error::{MailError, Result};
use courier_rs::security::{CredentialVerifier, StaticCredentials, TlsConfig};
use courier_rs::smtp::{MailIngressServer, SecurityMode};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

pub const USER: &str = "alice@example.com";
pub const PASSWORD: &str = "secret";

/// One accepted message as seen by a collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub sender: String,
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
}

/// Forwarder and processor that keeps every message in memory
#[derive(Default)]
pub struct Recorder {
    messages: Mutex<Vec<Recorded>>,
    fail: bool,
}

impl Recorder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<Recorded> {
        self.messages.lock().unwrap().clone()
    }

    fn record(&self, sender: &str, recipients: &[String], raw: &[u8]) -> Result<()> {
        if self.fail {
            return Err(MailError::Delivery("mailbox unavailable".to_string()));
        }
        self.messages.lock().unwrap().push(Recorded {
            sender: sender.to_string(),
            recipients: recipients.to_vec(),
            data: raw.to_vec(),
        });
        Ok(())
    }
}

#[async_trait]
impl Forwarder for Recorder {
    async fn forward_email(&self, sender: &str, recipients: &[String], raw: &[u8]) -> Result<()> {
        self.record(sender, recipients, raw)
    }
}

#[async_trait]
impl Processor for Recorder {
    async fn process_email(&self, sender: &str, recipients: &[String], raw: &[u8]) -> Result<()> {
        self.record(sender, recipients, raw)
    }
}

/// A running ingress server and the collaborators behind it
pub struct TestServer {
    pub forward: Option<SocketAddr>,
    pub starttls: SocketAddr,
    pub implicit: Option<SocketAddr>,
    pub forwarder: Arc<Recorder>,
    pub processor: Arc<Recorder>,
}

pub struct Options {
    pub tls: Option<TlsConfig>,
    pub enable_auth: bool,
    pub max_recipients: usize,
    pub max_message_size: usize,
    pub forwarder: Recorder,
    pub processor: Recorder,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tls: None,
            enable_auth: false,
            max_recipients: 100,
            max_message_size: 64 * 1024,
            forwarder: Recorder::default(),
            processor: Recorder::default(),
        }
    }
}

/// Helper function to start a test SMTP server on loopback ports
pub async fn start_smtp(options: Options) -> TestServer {
    let mut config = Config::default();
    config.server.hostname = "mx.test".to_string();
    config.smtp.forward_addr = "127.0.0.1:0".to_string();
    config.smtp.starttls_addr = "127.0.0.1:0".to_string();
    config.smtp.implicit_tls_addr = "127.0.0.1:0".to_string();
    config.smtp.enable_forwarding = true;
    config.smtp.enable_auth = options.enable_auth;
    config.smtp.max_recipients = options.max_recipients;
    config.smtp.max_message_size = options.max_message_size;
    config.smtp.idle_timeout_secs = 10;

    let forwarder = Arc::new(options.forwarder);
    let processor = Arc::new(options.processor);
    let verifier: Arc<dyn CredentialVerifier> =
        Arc::new(StaticCredentials::new().with_user(USER, PASSWORD));

    let server = MailIngressServer::with_security(
        &config.server,
        config.smtp.clone(),
        forwarder.clone(),
        processor.clone(),
        options.tls,
        Some(verifier),
    );
    let listeners = server.bind().await.unwrap();

    let mut forward = None;
    let mut starttls = None;
    let mut implicit = None;
    for listener in &listeners {
        let addr = listener.local_addr().unwrap();
        match listener.mode {
            SecurityMode::Forward => forward = Some(addr),
            SecurityMode::StartTls => starttls = Some(addr),
            SecurityMode::ImplicitTls => implicit = Some(addr),
        }
    }
    tokio::spawn(server.serve(listeners));

    TestServer {
        forward,
        starttls: starttls.unwrap(),
        implicit,
        forwarder,
        processor,
    }
}

/// Line-oriented SMTP client over any stream
pub struct Conversation<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conversation<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn send(&mut self, data: &[u8]) {
        self.stream.get_mut().write_all(data).await.unwrap();
        self.stream.get_mut().flush().await.unwrap();
    }

    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.stream.read_line(&mut line))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        line
    }

    /// Read one complete reply, joining continuation lines
    pub async fn reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            assert!(line.len() >= 4, "short reply line {:?} after {:?}", line, lines);
            let last = line.as_bytes()[3] == b' ';
            lines.push(line.trim_end().to_string());
            if last {
                return lines;
            }
        }
    }

    /// Send a command and return the reply code with the last reply line
    pub async fn command(&mut self, command: &str) -> (u16, String) {
        self.send(format!("{}\r\n", command).as_bytes()).await;
        let lines = self.reply().await;
        let last = lines.last().cloned().unwrap_or_default();
        (last[..3].parse().unwrap(), last)
    }

    pub async fn code(&mut self, command: &str) -> u16 {
        self.command(command).await.0
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}
