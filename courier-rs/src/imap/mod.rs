//! IMAP4rev1 server
//!
//! - [`receiver`]: streaming tokenizer with literal support
//! - [`token`]: argument tokens and string quoting
//! - [`sequence`]: message set expansion
//! - [`search`] / [`sort`]: SEARCH programs and the SORT comparator
//! - [`commands`]: command registry and typed argument parsing
//! - [`session`]: per-connection state machine
//! - [`store`]: storage collaborator traits

pub mod commands;
pub mod receiver;
pub mod response;
pub mod search;
pub mod sequence;
pub mod server;
pub mod session;
pub mod sort;
pub mod store;
pub mod token;

pub use commands::ImapCommand;
pub use receiver::{Command, Receiver, ReceiverError, Request};
pub use response::{Response, Status};
pub use server::ImapServer;
pub use session::{ImapSession, SessionState};
pub use store::{EmailItem, EmailStore, MailboxInfo, MailboxStore};
pub use token::Token;
