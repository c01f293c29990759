//! TLS server configuration
//!
//! Certificates are loaded from PEM files. When `generate_self_signed` is set
//! and the files are missing, a development certificate is created with
//! `rcgen` first.

use crate::config::TlsSettings;
use crate::error::{MailError, Result};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Shared rustls configuration for implicit TLS and STARTTLS
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Build from PEM encoded certificate chain and private key.
    /// PKCS#8 keys are tried first, then PKCS#1 RSA keys.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain = certs(&mut BufReader::new(cert_pem))
            .map_err(|e| MailError::Tls(format!("Failed to read certificates: {}", e)))?;
        if chain.is_empty() {
            return Err(MailError::Tls("No certificates found".to_string()));
        }
        debug!("Loaded {} certificate(s)", chain.len());

        let mut keys = pkcs8_private_keys(&mut BufReader::new(key_pem))
            .map_err(|e| MailError::Tls(format!("Failed to read private key: {}", e)))?;
        if keys.is_empty() {
            keys = rsa_private_keys(&mut BufReader::new(key_pem))
                .map_err(|e| MailError::Tls(format!("Failed to read private key: {}", e)))?;
        }
        let Some(key) = keys.into_iter().next() else {
            return Err(MailError::Tls("No private key found".to_string()));
        };

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                chain.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(key),
            )
            .map_err(|e| MailError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());
        let cert_pem = std::fs::read(cert_path.as_ref())
            .map_err(|e| MailError::Tls(format!("Failed to open certificate file: {}", e)))?;
        let key_pem = std::fs::read(key_path.as_ref())
            .map_err(|e| MailError::Tls(format!("Failed to open key file: {}", e)))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Resolve the `[tls]` settings. Returns `None` when no certificate is
    /// configured and none may be generated.
    pub fn load(settings: &TlsSettings, domain: &str) -> Result<Option<Self>> {
        let (Some(cert_path), Some(key_path)) = (&settings.cert_path, &settings.key_path) else {
            return Ok(None);
        };

        let present = Path::new(cert_path).exists() && Path::new(key_path).exists();
        if !present {
            if !settings.generate_self_signed {
                return Err(MailError::Tls(format!(
                    "Certificate {} or key {} not found",
                    cert_path, key_path
                )));
            }
            for path in [cert_path, key_path] {
                if let Some(parent) = Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            generate_self_signed_cert(domain, cert_path, key_path)?;
        }

        Self::from_pem_files(cert_path, key_path).map(Some)
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

/// PEM encoded certificate and private key
pub struct SelfSigned {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Create a self-signed certificate for `domain` and `*.domain`.
/// Development use only.
pub fn self_signed(domain: &str) -> Result<SelfSigned> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, domain);
    params.subject_alt_names = vec![
        SanType::DnsName(domain.to_string()),
        SanType::DnsName(format!("*.{}", domain)),
    ];

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| MailError::Tls(format!("Failed to generate certificate: {}", e)))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| MailError::Tls(format!("Failed to serialize certificate: {}", e)))?;

    Ok(SelfSigned {
        cert_pem,
        key_pem: cert.serialize_private_key_pem(),
    })
}

/// Write a fresh self-signed certificate and key to disk
pub fn generate_self_signed_cert(domain: &str, cert_output: &str, key_output: &str) -> Result<()> {
    info!("Generating self-signed certificate for {}", domain);

    let generated = self_signed(domain)?;
    std::fs::write(cert_output, generated.cert_pem)
        .map_err(|e| MailError::Tls(format!("Failed to write certificate: {}", e)))?;
    std::fs::write(key_output, generated.key_pem)
        .map_err(|e| MailError::Tls(format!("Failed to write private key: {}", e)))?;

    info!("Self-signed certificate written to {} and {}", cert_output, key_output);
    Ok(())
}
