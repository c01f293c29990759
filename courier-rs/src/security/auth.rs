//! Credential verification and SASL decoding
//!
//! Both protocols authenticate through a [`CredentialVerifier`]. Two
//! implementations ship:
//! - [`SqliteAuthenticator`]: Argon2 password hashes in a SQLite table,
//!   managed with the `courier-user` binary
//! - [`StaticCredentials`]: a fixed in-memory account list
//!
//! # Usage
//! ```no_run
//! use courier_rs::security::{CredentialVerifier, SqliteAuthenticator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let auth = SqliteAuthenticator::new("sqlite://users.db?mode=rwc").await?;
//! auth.add_user("user@example.com", "password123").await?;
//!
//! assert!(auth.verify("user@example.com", "password123").await?);
//! # Ok(())
//! # }
//! ```

use crate::error::{MailError, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// SASL mechanisms offered by IMAP AUTHENTICATE and SMTP AUTH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
    /// LOGIN mechanism
    Login,
}

impl AuthMechanism {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Checks a username/password pair
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `Ok(false)` for wrong credentials, `Err` only when the check itself failed
    async fn verify(&self, username: &str, password: &str) -> Result<bool>;
}

/// Decode a SASL PLAIN response
///
/// Format: `authzid\0username\0password` (base64 encoded)
pub fn decode_plain_auth(auth_data: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(auth_data.trim())
        .map_err(|e| MailError::MalformedCommand(format!("Invalid base64: {}", e)))?;

    let text = std::str::from_utf8(&decoded)
        .map_err(|e| MailError::MalformedCommand(format!("Invalid UTF-8: {}", e)))?;

    match text.split('\0').collect::<Vec<_>>().as_slice() {
        [_authzid, username, password] if !username.is_empty() => {
            Ok((username.to_string(), password.to_string()))
        }
        _ => Err(MailError::MalformedCommand(
            "Invalid PLAIN auth format".to_string(),
        )),
    }
}

/// Decode one base64 LOGIN challenge answer
pub fn decode_login_credential(credential: &str) -> Result<String> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| MailError::MalformedCommand(format!("Invalid base64: {}", e)))?;

    String::from_utf8(decoded)
        .map_err(|e| MailError::MalformedCommand(format!("Invalid UTF-8: {}", e)))
}

/// Account store backed by SQLite
#[derive(Clone)]
pub struct SqliteAuthenticator {
    db: SqlitePool,
}

impl SqliteAuthenticator {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to `sqlite::memory:` opens a distinct database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let db = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mail_users (
                email TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_login TEXT
            )
            "#,
        )
        .execute(&db)
        .await?;

        Ok(Self { db })
    }

    /// Add a new user
    ///
    /// # Security
    /// Password is hashed with Argon2 before storage
    pub async fn add_user(&self, email: &str, password: &str) -> Result<()> {
        info!("Adding user: {}", email);

        let password_hash = hash_password(password)?;

        sqlx::query(
            r#"
            INSERT INTO mail_users (email, password_hash, created_at)
            VALUES (?, ?, datetime('now'))
            "#,
        )
        .bind(email)
        .bind(&password_hash)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn set_password(&self, email: &str, password: &str) -> Result<()> {
        let password_hash = hash_password(password)?;

        let result = sqlx::query("UPDATE mail_users SET password_hash = ? WHERE email = ?")
            .bind(&password_hash)
            .bind(email)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MailError::NotFound(format!("No such user: {}", email)));
        }
        Ok(())
    }

    pub async fn user_exists(&self, email: &str) -> Result<bool> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mail_users WHERE email = ?")
            .bind(email)
            .fetch_one(&self.db)
            .await?;

        Ok(count.0 > 0)
    }

    pub async fn delete_user(&self, email: &str) -> Result<()> {
        info!("Deleting user: {}", email);

        let result = sqlx::query("DELETE FROM mail_users WHERE email = ?")
            .bind(email)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MailError::NotFound(format!("No such user: {}", email)));
        }
        Ok(())
    }

    /// Returns (email, created_at, last_login) tuples
    pub async fn list_users(&self) -> Result<Vec<(String, String, Option<String>)>> {
        let users = sqlx::query_as::<_, (String, String, Option<String>)>(
            r#"
            SELECT email, created_at, last_login
            FROM mail_users
            ORDER BY email
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(users)
    }
}

#[async_trait]
impl CredentialVerifier for SqliteAuthenticator {
    async fn verify(&self, username: &str, password: &str) -> Result<bool> {
        debug!("Authentication attempt for {}", username);

        let row = sqlx::query_as::<_, (String,)>(
            "SELECT password_hash FROM mail_users WHERE email = ?",
        )
        .bind(username)
        .fetch_optional(&self.db)
        .await?;

        let Some((stored_hash,)) = row else {
            warn!("Authentication failed: user not found: {}", username);
            return Ok(false);
        };

        let parsed_hash =
            PasswordHash::new(&stored_hash).map_err(|_| MailError::AuthenticationFailed)?;

        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_err()
        {
            warn!("Authentication failed: invalid password for {}", username);
            return Ok(false);
        }

        sqlx::query("UPDATE mail_users SET last_login = datetime('now') WHERE email = ?")
            .bind(username)
            .execute(&self.db)
            .await?;

        info!("Authentication successful for {}", username);
        Ok(true)
    }
}

/// Hash password with Argon2
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| MailError::Config(format!("Failed to hash password: {}", e)))?;

    Ok(password_hash.to_string())
}

/// Fixed username/password table
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify(&self, username: &str, password: &str) -> Result<bool> {
        Ok(self
            .users
            .get(username)
            .is_some_and(|expected| expected == password))
    }
}
