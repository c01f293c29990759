//! Maildir++ mailbox store
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/<user>/{tmp,new,cur}            INBOX
//! <root>/<user>/.<Folder>/{tmp,new,cur}  other mailboxes, `/` stored as `.`
//! ```
//!
//! Flags live in the `:2,` filename suffix. UIDs are kept in a
//! `courier-uidlist` file per folder: the first line holds the UID validity
//! and next UID, every other line maps a UID to the unique part of a file
//! name. Files that appear without a UID are numbered in name order, which
//! starts with the delivery timestamp.

use crate::error::{MailError, Result};
use crate::imap::search::SearchFilter;
use crate::imap::store::{
    EmailItem, EmailStore, MailboxInfo, MailboxStore, StoreOperation, SYSTEM_FLAGS,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

const UIDLIST: &str = "courier-uidlist";

static DELIVERY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Maildir flag letters, in the order they are written
const FLAG_LETTERS: [(char, &str); 5] = [
    ('D', "\\Draft"),
    ('F', "\\Flagged"),
    ('R', "\\Answered"),
    ('S', "\\Seen"),
    ('T', "\\Deleted"),
];

fn parse_maildir_flags(filename: &str) -> Vec<String> {
    let Some((_, letters)) = filename.split_once(":2,") else {
        return Vec::new();
    };
    FLAG_LETTERS
        .iter()
        .filter(|(letter, _)| letters.contains(*letter))
        .map(|(_, flag)| flag.to_string())
        .collect()
}

fn encode_maildir_flags(flags: &[String]) -> String {
    FLAG_LETTERS
        .iter()
        .filter(|(_, flag)| flags.iter().any(|f| f.eq_ignore_ascii_case(flag)))
        .map(|(letter, _)| *letter)
        .collect()
}

/// Unique part of a maildir file name, without the info suffix
fn base_name(filename: &str) -> &str {
    filename.split_once(':').map_or(filename, |(base, _)| base)
}

/// Maildir filename format: seconds.MmicrosPpidQcounter.hostname
fn generate_filename() -> String {
    let now = Utc::now();
    let hostname = gethostname::gethostname()
        .to_string_lossy()
        .replace(['/', ':'], "_");
    format!(
        "{}.M{:06}P{}Q{}.{}",
        now.timestamp(),
        now.timestamp_subsec_micros(),
        std::process::id(),
        DELIVERY_COUNTER.fetch_add(1, Ordering::Relaxed),
        hostname
    )
}

async fn ensure_maildir_structure(path: &Path) -> Result<()> {
    for subdir in ["tmp", "new", "cur"] {
        let dir = path.join(subdir);
        fs::create_dir_all(&dir).await.map_err(|e| {
            MailError::Storage(format!("Failed to create directory {:?}: {}", dir, e))
        })?;
    }
    Ok(())
}

struct Entry {
    uid: u32,
    base: String,
    path: PathBuf,
    flags: Vec<String>,
    /// Still in `new/`, counted as recent
    recent: bool,
}

struct Folder {
    path: PathBuf,
    uid_validity: u32,
    uid_next: u32,
    /// Sorted by UID
    entries: Vec<Entry>,
}

impl Folder {
    fn entry(&self, uid: u32) -> Option<&Entry> {
        self.entries
            .binary_search_by_key(&uid, |entry| entry.uid)
            .ok()
            .map(|index| &self.entries[index])
    }
}

pub struct MaildirStore {
    root: PathBuf,
    /// Serializes UID list updates
    lock: Mutex<()>,
}

impl MaildirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn folder_path(&self, user: &str, mailbox: &str) -> PathBuf {
        let user_dir = self.root.join(user);
        if mailbox.eq_ignore_ascii_case("INBOX") {
            user_dir
        } else {
            user_dir.join(format!(".{}", mailbox.replace('/', ".")))
        }
    }

    /// Create a mailbox folder if it does not exist
    pub async fn create_mailbox(&self, user: &str, mailbox: &str) -> Result<()> {
        ensure_maildir_structure(&self.folder_path(user, mailbox)).await
    }

    /// Deliver a message to the user's INBOX `new/` through `tmp/`
    pub async fn deliver(&self, user: &str, data: &[u8]) -> Result<String> {
        let mailbox_path = self.folder_path(user, "INBOX");
        ensure_maildir_structure(&mailbox_path).await?;

        let filename = generate_filename();
        let tmp_path = mailbox_path.join("tmp").join(&filename);
        let new_path = mailbox_path.join("new").join(&filename);

        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &new_path).await?;

        info!("Stored email for {} as {}", user, new_path.display());
        Ok(filename)
    }

    async fn read_dir_files(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// Load a folder, numbering new files and forgetting vanished ones
    async fn scan(&self, user: &str, mailbox: &str) -> Result<Option<Folder>> {
        let path = self.folder_path(user, mailbox);
        if !fs::try_exists(path.join("cur")).await? && !fs::try_exists(path.join("new")).await? {
            return Ok(None);
        }

        let uidlist_path = path.join(UIDLIST);
        let (mut uid_validity, mut uid_next, mut known) = (0u32, 1u32, HashMap::new());
        let mut dirty = false;
        match fs::read_to_string(&uidlist_path).await {
            Ok(content) => {
                let mut lines = content.lines();
                if let Some(header) = lines.next() {
                    for field in header.split_whitespace() {
                        if let Some(value) = field.strip_prefix('V') {
                            uid_validity = value.parse().unwrap_or(0);
                        } else if let Some(value) = field.strip_prefix('N') {
                            uid_next = value.parse().unwrap_or(1);
                        }
                    }
                }
                for line in lines {
                    if let Some((uid, base)) = line.split_once(' ') {
                        if let Ok(uid) = uid.parse::<u32>() {
                            known.insert(base.to_string(), uid);
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => dirty = true,
            Err(e) => return Err(e.into()),
        }
        if uid_validity == 0 {
            uid_validity = Utc::now().timestamp() as u32;
            dirty = true;
        }

        let mut files = Vec::new();
        for (subdir, recent) in [("new", true), ("cur", false)] {
            for name in Self::read_dir_files(&path.join(subdir)).await? {
                files.push((name, subdir, recent));
            }
        }
        files.sort_by(|a, b| base_name(&a.0).cmp(base_name(&b.0)));

        let known_count = known.len();
        let mut entries = Vec::with_capacity(files.len());
        for (name, subdir, recent) in files {
            let base = base_name(&name).to_string();
            let uid = match known.remove(&base) {
                Some(uid) => uid,
                None => {
                    let uid = uid_next;
                    uid_next += 1;
                    dirty = true;
                    uid
                }
            };
            entries.push(Entry {
                uid,
                flags: parse_maildir_flags(&name),
                path: path.join(subdir).join(&name),
                base,
                recent,
            });
        }
        // Anything left in `known` was deleted behind our back
        if !known.is_empty() || known_count > entries.len() {
            dirty = true;
        }
        entries.sort_by_key(|entry| entry.uid);

        let folder = Folder {
            path,
            uid_validity,
            uid_next,
            entries,
        };
        if dirty {
            Self::save_uidlist(&folder).await?;
        }
        Ok(Some(folder))
    }

    async fn save_uidlist(folder: &Folder) -> Result<()> {
        let mut content = format!("V{} N{}\n", folder.uid_validity, folder.uid_next);
        for entry in &folder.entries {
            content.push_str(&format!("{} {}\n", entry.uid, entry.base));
        }
        let tmp_path = folder.path.join(format!("{}.tmp", UIDLIST));
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, folder.path.join(UIDLIST)).await?;
        Ok(())
    }

    async fn scan_existing(&self, user: &str, mailbox: &str) -> Result<Folder> {
        self.scan(user, mailbox)
            .await?
            .ok_or_else(|| MailError::NotFound(format!("Mailbox {} does not exist", mailbox)))
    }

    async fn load_item(entry: &Entry) -> Result<(EmailItem, Vec<u8>)> {
        let raw = fs::read(&entry.path).await?;
        let modified = fs::metadata(&entry.path).await?.modified()?;

        let mut item = super::summarize(&raw);
        item.uid = entry.uid;
        item.flags = entry.flags.clone();
        item.internal_date = Some(DateTime::<Utc>::from(modified));
        Ok((item, raw))
    }

    /// Write `raw` into `cur/` of a folder with the given flags
    async fn write_message(folder_path: &Path, flags: &[String], raw: &[u8]) -> Result<String> {
        let filename = generate_filename();
        let tmp_path = folder_path.join("tmp").join(&filename);
        fs::write(&tmp_path, raw).await?;
        fs::rename(
            &tmp_path,
            folder_path
                .join("cur")
                .join(format!("{}:2,{}", filename, encode_maildir_flags(flags))),
        )
        .await?;
        Ok(filename)
    }
}

#[async_trait]
impl MailboxStore for MaildirStore {
    async fn get_mailbox(&self, user: &str, name: &str) -> Result<Option<MailboxInfo>> {
        let _guard = self.lock.lock().await;
        let Some(folder) = self.scan(user, name).await? else {
            return Ok(None);
        };

        let flag_names: Vec<String> = SYSTEM_FLAGS.iter().map(|flag| flag.to_string()).collect();
        Ok(Some(MailboxInfo {
            name: name.to_string(),
            recent: folder.entries.iter().filter(|entry| entry.recent).count() as u32,
            unseen: folder
                .entries
                .iter()
                .filter(|entry| !entry.flags.iter().any(|flag| flag == "\\Seen"))
                .count() as u32,
            uid_validity: folder.uid_validity,
            uid_next: folder.uid_next,
            permanent_flags: flag_names.clone(),
            flags: flag_names,
        }))
    }

    async fn list_mailboxes(&self, user: &str) -> Result<Vec<String>> {
        let user_dir = self.root.join(user);
        let mut mailboxes = Vec::new();
        if !fs::try_exists(&user_dir).await? {
            return Ok(mailboxes);
        }
        mailboxes.push("INBOX".to_string());

        let mut entries = fs::read_dir(&user_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(folder) = name.strip_prefix('.') {
                mailboxes.push(folder.replace('.', "/"));
            }
        }
        mailboxes.sort();
        Ok(mailboxes)
    }
}

#[async_trait]
impl EmailStore for MaildirStore {
    async fn count(&self, user: &str, mailbox: &str) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.scan_existing(user, mailbox).await?.entries.len())
    }

    async fn find(
        &self,
        user: &str,
        mailbox: &str,
        filter: &SearchFilter,
    ) -> Result<Vec<EmailItem>> {
        let _guard = self.lock.lock().await;
        let folder = self.scan_existing(user, mailbox).await?;

        let mut items = Vec::new();
        for entry in &folder.entries {
            let (item, raw) = Self::load_item(entry).await?;
            if filter.matches(&item, &raw) {
                items.push(item);
            }
        }
        debug!("{} of {} messages in {} matched", items.len(), folder.entries.len(), mailbox);
        Ok(items)
    }

    async fn fetch_raw(&self, user: &str, mailbox: &str, uid: u32) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().await;
        let folder = self.scan_existing(user, mailbox).await?;
        match folder.entry(uid) {
            Some(entry) => Ok(Some(fs::read(&entry.path).await?)),
            None => Ok(None),
        }
    }

    async fn store_flags(
        &self,
        user: &str,
        mailbox: &str,
        uids: &[u32],
        operation: StoreOperation,
        flags: &[String],
    ) -> Result<Vec<EmailItem>> {
        let _guard = self.lock.lock().await;
        let folder = self.scan_existing(user, mailbox).await?;

        let mut updated = Vec::new();
        for uid in uids {
            let Some(entry) = folder.entry(*uid) else {
                continue;
            };
            let mut new_flags = entry.flags.clone();
            operation.apply(&mut new_flags, flags);

            // Keywords have no maildir letter, only system flags persist
            let target = folder.path.join("cur").join(format!(
                "{}:2,{}",
                entry.base,
                encode_maildir_flags(&new_flags)
            ));
            if target != entry.path {
                fs::rename(&entry.path, &target).await?;
            }

            let moved = Entry {
                uid: entry.uid,
                base: entry.base.clone(),
                flags: parse_maildir_flags(&target.to_string_lossy()),
                path: target,
                recent: false,
            };
            updated.push(Self::load_item(&moved).await?.0);
        }
        Ok(updated)
    }

    async fn expunge(&self, user: &str, mailbox: &str) -> Result<Vec<u32>> {
        let _guard = self.lock.lock().await;
        let mut folder = self.scan_existing(user, mailbox).await?;

        let mut removed = Vec::new();
        for entry in &folder.entries {
            if entry.flags.iter().any(|flag| flag == "\\Deleted") {
                fs::remove_file(&entry.path).await?;
                removed.push(entry.uid);
            }
        }
        if !removed.is_empty() {
            folder.entries.retain(|entry| !removed.contains(&entry.uid));
            Self::save_uidlist(&folder).await?;
        }
        Ok(removed)
    }

    async fn append(&self, user: &str, mailbox: &str, flags: &[String], raw: &[u8]) -> Result<u32> {
        let _guard = self.lock.lock().await;
        let folder = self.scan_existing(user, mailbox).await?;

        let base = Self::write_message(&folder.path, flags, raw).await?;
        let folder = self.scan_existing(user, mailbox).await?;
        folder
            .entries
            .iter()
            .find(|entry| entry.base == base)
            .map(|entry| entry.uid)
            .ok_or_else(|| MailError::Storage(format!("Appended message {} vanished", base)))
    }

    async fn copy(
        &self,
        user: &str,
        source: &str,
        uids: &[u32],
        destination: &str,
    ) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let from = self.scan_existing(user, source).await?;
        let to = self.scan_existing(user, destination).await?;

        let mut copied = 0;
        for uid in uids {
            if let Some(entry) = from.entry(*uid) {
                let raw = fs::read(&entry.path).await?;
                Self::write_message(&to.path, &entry.flags, &raw).await?;
                copied += 1;
            }
        }
        // Number the copies now so their UIDs follow the copy order
        self.scan_existing(user, destination).await?;
        Ok(copied)
    }
}
