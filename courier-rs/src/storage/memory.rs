//! In-process mailbox store
//!
//! Keeps every mailbox in a map guarded by a mutex. Used by the test suites
//! and usable wherever durability is not needed.

use crate::error::{MailError, Result};
use crate::imap::search::SearchFilter;
use crate::imap::store::{
    EmailItem, EmailStore, MailboxInfo, MailboxStore, StoreOperation, SYSTEM_FLAGS,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

struct StoredMessage {
    item: EmailItem,
    raw: Vec<u8>,
}

struct MemoryMailbox {
    uid_validity: u32,
    uid_next: u32,
    messages: Vec<StoredMessage>,
}

impl MemoryMailbox {
    fn new(uid_validity: u32) -> Self {
        Self {
            uid_validity,
            uid_next: 1,
            messages: Vec::new(),
        }
    }

    fn push(&mut self, mut item: EmailItem, raw: Vec<u8>) -> u32 {
        item.uid = self.uid_next;
        self.uid_next += 1;
        if item.size.is_none() {
            item.size = Some(raw.len() as u64);
        }
        if item.internal_date.is_none() {
            item.internal_date = Some(Utc::now());
        }
        let uid = item.uid;
        self.messages.push(StoredMessage { item, raw });
        uid
    }
}

#[derive(Default)]
pub struct MemoryStore {
    /// Keyed by (user, mailbox name)
    mailboxes: Mutex<BTreeMap<(String, String), MemoryMailbox>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(String, String), MemoryMailbox>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(user: &str, mailbox: &str) -> (String, String) {
        (user.to_string(), mailbox.to_string())
    }

    fn missing(mailbox: &str) -> MailError {
        MailError::NotFound(format!("Mailbox {} does not exist", mailbox))
    }

    /// Create an empty mailbox; existing mailboxes are left untouched
    pub fn create_mailbox(&self, user: &str, mailbox: &str) {
        let mut mailboxes = self.lock();
        let uid_validity = mailboxes.len() as u32 + 1;
        mailboxes
            .entry(Self::key(user, mailbox))
            .or_insert_with(|| MemoryMailbox::new(uid_validity));
    }

    /// Add a message, creating the mailbox if needed, and return its UID.
    /// Missing size and internal date are filled in from `raw` and the clock.
    pub fn insert(&self, user: &str, mailbox: &str, item: EmailItem, raw: Vec<u8>) -> u32 {
        let mut mailboxes = self.lock();
        let uid_validity = mailboxes.len() as u32 + 1;
        mailboxes
            .entry(Self::key(user, mailbox))
            .or_insert_with(|| MemoryMailbox::new(uid_validity))
            .push(item, raw)
    }
}

#[async_trait]
impl MailboxStore for MemoryStore {
    async fn get_mailbox(&self, user: &str, name: &str) -> Result<Option<MailboxInfo>> {
        let mailboxes = self.lock();
        Ok(mailboxes.get(&Self::key(user, name)).map(|mailbox| MailboxInfo {
            name: name.to_string(),
            recent: 0,
            unseen: mailbox
                .messages
                .iter()
                .filter(|message| !message.item.has_flag("\\Seen"))
                .count() as u32,
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
            flags: SYSTEM_FLAGS.iter().map(|flag| flag.to_string()).collect(),
            permanent_flags: SYSTEM_FLAGS
                .iter()
                .map(|flag| flag.to_string())
                .chain(std::iter::once("\\*".to_string()))
                .collect(),
        }))
    }

    async fn list_mailboxes(&self, user: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .keys()
            .filter(|(owner, _)| owner == user)
            .map(|(_, name)| name.clone())
            .collect())
    }
}

#[async_trait]
impl EmailStore for MemoryStore {
    async fn count(&self, user: &str, mailbox: &str) -> Result<usize> {
        self.lock()
            .get(&Self::key(user, mailbox))
            .map(|mailbox| mailbox.messages.len())
            .ok_or_else(|| Self::missing(mailbox))
    }

    async fn find(
        &self,
        user: &str,
        mailbox: &str,
        filter: &SearchFilter,
    ) -> Result<Vec<EmailItem>> {
        let mailboxes = self.lock();
        let stored = mailboxes
            .get(&Self::key(user, mailbox))
            .ok_or_else(|| Self::missing(mailbox))?;
        Ok(stored
            .messages
            .iter()
            .filter(|message| filter.matches(&message.item, &message.raw))
            .map(|message| message.item.clone())
            .collect())
    }

    async fn fetch_raw(&self, user: &str, mailbox: &str, uid: u32) -> Result<Option<Vec<u8>>> {
        let mailboxes = self.lock();
        let stored = mailboxes
            .get(&Self::key(user, mailbox))
            .ok_or_else(|| Self::missing(mailbox))?;
        Ok(stored
            .messages
            .iter()
            .find(|message| message.item.uid == uid)
            .map(|message| message.raw.clone()))
    }

    async fn store_flags(
        &self,
        user: &str,
        mailbox: &str,
        uids: &[u32],
        operation: StoreOperation,
        flags: &[String],
    ) -> Result<Vec<EmailItem>> {
        let mut mailboxes = self.lock();
        let stored = mailboxes
            .get_mut(&Self::key(user, mailbox))
            .ok_or_else(|| Self::missing(mailbox))?;

        let mut updated = Vec::new();
        for message in stored
            .messages
            .iter_mut()
            .filter(|message| uids.contains(&message.item.uid))
        {
            operation.apply(&mut message.item.flags, flags);
            updated.push(message.item.clone());
        }
        Ok(updated)
    }

    async fn expunge(&self, user: &str, mailbox: &str) -> Result<Vec<u32>> {
        let mut mailboxes = self.lock();
        let stored = mailboxes
            .get_mut(&Self::key(user, mailbox))
            .ok_or_else(|| Self::missing(mailbox))?;

        let mut removed = Vec::new();
        stored.messages.retain(|message| {
            let deleted = message.item.has_flag("\\Deleted");
            if deleted {
                removed.push(message.item.uid);
            }
            !deleted
        });
        Ok(removed)
    }

    async fn append(&self, user: &str, mailbox: &str, flags: &[String], raw: &[u8]) -> Result<u32> {
        let mut mailboxes = self.lock();
        let stored = mailboxes
            .get_mut(&Self::key(user, mailbox))
            .ok_or_else(|| Self::missing(mailbox))?;

        let mut item = crate::storage::summarize(raw);
        item.flags = flags.to_vec();
        Ok(stored.push(item, raw.to_vec()))
    }

    async fn copy(
        &self,
        user: &str,
        source: &str,
        uids: &[u32],
        destination: &str,
    ) -> Result<usize> {
        let mut mailboxes = self.lock();
        let copies: Vec<(EmailItem, Vec<u8>)> = mailboxes
            .get(&Self::key(user, source))
            .ok_or_else(|| Self::missing(source))?
            .messages
            .iter()
            .filter(|message| uids.contains(&message.item.uid))
            .map(|message| {
                let mut item = message.item.clone();
                item.internal_date = None;
                (item, message.raw.clone())
            })
            .collect();

        let target = mailboxes
            .get_mut(&Self::key(user, destination))
            .ok_or_else(|| Self::missing(destination))?;
        let copied = copies.len();
        for (item, raw) in copies {
            target.push(item, raw);
        }
        Ok(copied)
    }
}
