//! Email storage module
//!
//! Provides the mailbox stores behind the IMAP session and local delivery:
//! - [`maildir`]: Maildir++ folders on disk with a per-folder UID list
//! - [`memory`]: in-process store for tests and embedding

pub mod maildir;
pub mod memory;

pub use maildir::MaildirStore;
pub use memory::MemoryStore;

use crate::imap::store::{Address, EmailItem};
use chrono::DateTime;
use mail_parser::MessageParser;

fn addresses(header: Option<&mail_parser::Address<'_>>) -> Vec<Address> {
    header
        .map(|list| {
            list.iter()
                .filter_map(|addr| {
                    addr.address().map(|email| Address {
                        name: addr.name().map(|name| name.to_string()),
                        email: email.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Build the sort/search summary of a raw RFC 5322 message.
///
/// UID, flags and internal date are left for the store to fill in.
pub fn summarize(raw: &[u8]) -> EmailItem {
    let mut item = EmailItem {
        size: Some(raw.len() as u64),
        ..Default::default()
    };

    if let Some(parsed) = MessageParser::default().parse(raw) {
        item.subject = parsed.subject().map(|subject| subject.to_string());
        item.date = parsed
            .date()
            .and_then(|date| DateTime::from_timestamp(date.to_timestamp(), 0));
        item.from = addresses(parsed.from());
        item.to = addresses(parsed.to());
        item.cc = addresses(parsed.cc());
    }

    item
}
