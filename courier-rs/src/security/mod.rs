//! Security module
//!
//! - [`auth`]: credential verification and SASL PLAIN/LOGIN decoding
//! - [`tls`]: rustls server configuration shared by IMAP and SMTP

pub mod auth;
pub mod tls;

pub use auth::{AuthMechanism, CredentialVerifier, SqliteAuthenticator, StaticCredentials};
pub use tls::TlsConfig;
