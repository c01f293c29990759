//! courier-rs: IMAP and SMTP mail protocol engine
//!
//! # Features
//!
//! - **IMAP**: streaming tokenizer with literals, snapshot message sets,
//!   SEARCH and SORT with a composite comparator, session state machine
//! - **SMTP**: forward, STARTTLS and implicit TLS listeners with an in-place
//!   TLS upgrade that discards pipelined plaintext
//! - **Storage**: Maildir++ folders or an in-memory store
//! - **Security**: Argon2 credentials in SQLite, rustls
//!
//! # Example
//!
//! ```no_run
//! use courier_rs::config::Config;
//! use courier_rs::delivery::{MaildirProcessor, NoRelay};
//! use courier_rs::smtp::MailIngressServer;
//! use courier_rs::storage::MaildirStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let store = Arc::new(MaildirStore::new(&config.storage.maildir_path));
//!
//!     let server = MailIngressServer::new(
//!         &config.server,
//!         config.smtp.clone(),
//!         Arc::new(NoRelay),
//!         Arc::new(MaildirProcessor::new(store)),
//!     );
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`imap`]: IMAP protocol implementation
//! - [`smtp`]: SMTP protocol implementation
//! - [`delivery`]: Forwarder and processor collaborators
//! - [`storage`]: Mailbox stores
//! - [`security`]: TLS and authentication

pub mod config;
pub mod delivery;
pub mod error;
pub mod imap;
pub mod security;
pub mod smtp;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use error::{MailError, Result};
