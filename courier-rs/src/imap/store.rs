//! Storage collaborators queried by the IMAP session
//!
//! The session never touches message files directly. It asks a
//! [`MailboxStore`] for mailbox metadata and an [`EmailStore`] for message
//! summaries, raw content and flag changes. Both are keyed by the
//! authenticated user and the mailbox name; messages are addressed by UID.

use crate::error::Result;
use crate::imap::search::SearchFilter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Flags every store supports
pub const SYSTEM_FLAGS: [&str; 5] = ["\\Answered", "\\Flagged", "\\Deleted", "\\Seen", "\\Draft"];

/// Mailbox metadata reported on SELECT, EXAMINE and STATUS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    pub name: String,
    pub recent: u32,
    /// Number of messages without `\Seen`
    pub unseen: u32,
    pub uid_validity: u32,
    pub uid_next: u32,
    pub flags: Vec<String>,
    pub permanent_flags: Vec<String>,
}

/// One mailbox/display-name pair from an address header
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub name: Option<String>,
    pub email: String,
}

impl Address {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Display name when present, the address otherwise
    pub fn display(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.email)
    }
}

/// Message summary used for SEARCH, SORT and FETCH
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EmailItem {
    pub uid: u32,
    /// When the server received the message
    pub internal_date: Option<DateTime<Utc>>,
    /// The `Date:` header
    pub date: Option<DateTime<Utc>>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub subject: Option<String>,
    pub size: Option<u64>,
    pub flags: Vec<String>,
}

impl EmailItem {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

/// STORE operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// +FLAGS - Add flags to message
    Add,
    /// -FLAGS - Remove flags from message
    Remove,
    /// FLAGS - Replace all flags
    Replace,
}

impl StoreOperation {
    /// Apply the operation to a flag list, keeping the original order
    pub fn apply(self, current: &mut Vec<String>, flags: &[String]) {
        match self {
            StoreOperation::Add => {
                for flag in flags {
                    if !current.iter().any(|f| f.eq_ignore_ascii_case(flag)) {
                        current.push(flag.clone());
                    }
                }
            }
            StoreOperation::Remove => {
                current.retain(|f| !flags.iter().any(|r| r.eq_ignore_ascii_case(f)));
            }
            StoreOperation::Replace => {
                *current = flags.to_vec();
            }
        }
    }
}

#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Metadata for `name`, or `None` when the mailbox does not exist
    async fn get_mailbox(&self, user: &str, name: &str) -> Result<Option<MailboxInfo>>;

    async fn list_mailboxes(&self, user: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait EmailStore: Send + Sync {
    async fn count(&self, user: &str, mailbox: &str) -> Result<usize>;

    /// Messages matching `filter`, in arrival order
    async fn find(&self, user: &str, mailbox: &str, filter: &SearchFilter)
        -> Result<Vec<EmailItem>>;

    async fn fetch_raw(&self, user: &str, mailbox: &str, uid: u32) -> Result<Option<Vec<u8>>>;

    /// Change flags and return the updated summaries
    async fn store_flags(
        &self,
        user: &str,
        mailbox: &str,
        uids: &[u32],
        operation: StoreOperation,
        flags: &[String],
    ) -> Result<Vec<EmailItem>>;

    /// Remove `\Deleted` messages and return their UIDs
    async fn expunge(&self, user: &str, mailbox: &str) -> Result<Vec<u32>>;

    /// Add a message and return its UID
    async fn append(&self, user: &str, mailbox: &str, flags: &[String], raw: &[u8]) -> Result<u32>;

    /// Copy messages to another mailbox and return how many were copied
    async fn copy(&self, user: &str, source: &str, uids: &[u32], destination: &str)
        -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_store_operation_add() {
        let mut current = flags(&["\\Seen"]);
        StoreOperation::Add.apply(&mut current, &flags(&["\\seen", "\\Flagged"]));
        assert_eq!(current, flags(&["\\Seen", "\\Flagged"]));
    }

    #[test]
    fn test_store_operation_remove_and_replace() {
        let mut current = flags(&["\\Seen", "\\Deleted"]);
        StoreOperation::Remove.apply(&mut current, &flags(&["\\DELETED"]));
        assert_eq!(current, flags(&["\\Seen"]));

        StoreOperation::Replace.apply(&mut current, &flags(&["\\Draft"]));
        assert_eq!(current, flags(&["\\Draft"]));
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::with_name("Alice", "a@example.com").display(), "Alice");
        assert_eq!(Address::with_name("", "a@example.com").display(), "a@example.com");
        assert_eq!(Address::new("b@example.com").display(), "b@example.com");
    }
}
