use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    pub tls: TlsSettings,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub domain: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImapConfig {
    pub listen_addr: String,
    pub implicit_tls: bool,
    pub max_literal_size: usize,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    /// Plaintext port whose messages are relayed outbound
    pub forward_addr: String,
    /// Plaintext port that may be upgraded with STARTTLS
    pub starttls_addr: String,
    /// Port that speaks TLS from the first byte
    pub implicit_tls_addr: String,
    pub enable_forwarding: bool,
    pub relay_host: Option<String>,
    pub enable_auth: bool,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsSettings {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub generate_self_signed: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub maildir_path: String,
    pub database_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl ImapConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl SmtpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| MailError::Config(e.to_string()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MailError::Config(e.to_string()))
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig {
                domain: "localhost".to_string(),
                hostname: "mail.localhost".to_string(),
            },
            imap: ImapConfig {
                listen_addr: "0.0.0.0:1143".to_string(),
                implicit_tls: false,
                max_literal_size: 25 * 1024 * 1024, // 25MB
                idle_timeout_secs: 30 * 60,
            },
            smtp: SmtpConfig {
                forward_addr: "0.0.0.0:2525".to_string(),
                starttls_addr: "0.0.0.0:2587".to_string(),
                implicit_tls_addr: "0.0.0.0:2465".to_string(),
                enable_forwarding: false,
                relay_host: None,
                enable_auth: false,
                max_message_size: 10 * 1024 * 1024, // 10MB
                max_recipients: 100,
                idle_timeout_secs: 5 * 60,
            },
            tls: TlsSettings {
                cert_path: Some("data/tls/cert.pem".to_string()),
                key_path: Some("data/tls/key.pem".to_string()),
                generate_self_signed: true,
            },
            storage: StorageConfig {
                maildir_path: "/tmp/maildir".to_string(),
                database_url: "sqlite://mail.db?mode=rwc".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}
