//! SMTP ingress (RFC 5321)
//!
//! - [`server`]: listeners for the forward, STARTTLS and implicit TLS ports
//! - [`session`]: per-connection handler and STARTTLS upgrade
//! - [`transaction`]: envelope state machine and DATA accumulation
//! - [`commands`]: command line parsing
//! - [`client`]: outbound client used by the relay forwarder

pub mod client;
pub mod commands;
pub mod server;
pub mod session;
pub mod transaction;

pub use client::SmtpClient;
pub use commands::SmtpCommand;
pub use server::{MailIngressServer, ModeListener};
pub use session::{SecurityMode, SmtpSession};
pub use transaction::{Envelope, Reply, SmtpTransaction};
