//! IMAP session management
//!
//! Handles the IMAP protocol state machine and command execution. A session
//! is owned by exactly one connection task; it is fed one parsed
//! [`Command`] at a time and always answers with a complete [`Response`].

use crate::error::{MailError, Result};
use crate::imap::commands::{
    lookup, FetchItem, ImapCommand, RequiredState, Section, StatusItem,
};
use crate::imap::receiver::Command;
use crate::imap::response::{paren_list, Response};
use crate::imap::search::SearchFilter;
use crate::imap::sequence::parse_message_set;
use crate::imap::sort::{apply_sort, SortKey};
use crate::imap::store::{EmailItem, EmailStore, MailboxStore, StoreOperation};
use crate::imap::token::quote;
use crate::security::auth::{decode_plain_auth, CredentialVerifier};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Advertised in the greeting and in CAPABILITY
pub const CAPABILITIES: &str = "IMAP4rev1 LITERAL+ SORT SORT=DISPLAY UNSELECT AUTH=PLAIN";

/// Hierarchy delimiter reported by LIST
const DELIMITER: char = '/';

/// IMAP session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    /// Terminal, the connection is closed after the LOGOUT response
    LoggedOut,
}

/// Mailbox opened by SELECT or EXAMINE
#[derive(Debug, Clone)]
struct SelectedMailbox {
    name: String,
    read_only: bool,
    /// UIDs in sequence-number order, captured when the mailbox was opened
    uids: Vec<u32>,
}

impl SelectedMailbox {
    fn sequence_of(&self) -> HashMap<u32, u32> {
        self.uids
            .iter()
            .enumerate()
            .map(|(index, uid)| (*uid, index as u32 + 1))
            .collect()
    }

    /// Resolve a sequence set (or UID set) to `(sequence number, uid)` pairs
    fn resolve(&self, set: &str, uid_mode: bool) -> Result<Vec<(u32, u32)>> {
        if uid_mode {
            let max_uid = self.uids.last().copied().unwrap_or(0);
            let sequence_of = self.sequence_of();
            Ok(parse_message_set(set, max_uid)?
                .into_iter()
                .filter_map(|uid| sequence_of.get(&uid).map(|seq| (*seq, uid)))
                .collect())
        } else {
            Ok(parse_message_set(set, self.uids.len() as u32)?
                .into_iter()
                .map(|seq| (seq, self.uids[seq as usize - 1]))
                .collect())
        }
    }
}

/// Per-connection IMAP session
pub struct ImapSession {
    state: SessionState,
    user: Option<String>,
    selected: Option<SelectedMailbox>,
    connection_id: String,
    mailboxes: Arc<dyn MailboxStore>,
    emails: Arc<dyn EmailStore>,
    credentials: Arc<dyn CredentialVerifier>,
    /// Tag of an AUTHENTICATE waiting for its continuation line
    pending_auth: Option<String>,
}

impl ImapSession {
    pub fn new(
        mailboxes: Arc<dyn MailboxStore>,
        emails: Arc<dyn EmailStore>,
        credentials: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            state: SessionState::NotAuthenticated,
            user: None,
            selected: None,
            connection_id: Uuid::new_v4().to_string(),
            mailboxes,
            emails,
            credentials,
            pending_auth: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn is_read_only(&self) -> bool {
        self.selected.as_ref().is_some_and(|mailbox| mailbox.read_only)
    }

    pub fn selected_mailbox(&self) -> Option<&str> {
        self.selected.as_ref().map(|mailbox| mailbox.name.as_str())
    }

    /// Untagged server greeting
    pub fn greeting(&self) -> Response {
        let mut response = Response::new();
        response.untagged(format!("OK [CAPABILITY {}] IMAP4rev1 Service Ready", CAPABILITIES));
        response
    }

    /// Run one command. Every outcome, including errors, is a tagged response.
    pub async fn handle(&mut self, command: Command) -> Response {
        debug!(
            connection = %self.connection_id,
            "Handling IMAP command {} in state {:?}",
            command.verb,
            self.state
        );

        let tag = command.tag.clone();
        match self.dispatch(command).await {
            Ok(response) => response,
            Err(e) => {
                let mut response = Response::new();
                if e.is_bad() {
                    response.bad(&tag, e.to_string());
                } else {
                    warn!(connection = %self.connection_id, "Command {} failed: {}", tag, e);
                    response.no(&tag, e.to_string());
                }
                response
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> Result<Response> {
        if self.state == SessionState::LoggedOut {
            return Err(MailError::InvalidState("Session has logged out".to_string()));
        }

        let spec = lookup(&command.verb).ok_or_else(|| {
            MailError::MalformedCommand(format!("Unknown command: {}", command.verb))
        })?;
        if command.uid && !spec.uid {
            return Err(MailError::MalformedCommand(format!(
                "UID {} is not a valid command",
                command.verb
            )));
        }

        match (spec.state, self.state) {
            (RequiredState::NotAuthenticated, SessionState::NotAuthenticated) => {}
            (RequiredState::NotAuthenticated, _) => {
                return Err(MailError::InvalidState("Already authenticated".to_string()))
            }
            (RequiredState::Authenticated | RequiredState::Selected, SessionState::NotAuthenticated) => {
                return Err(MailError::InvalidState("Must be authenticated".to_string()))
            }
            (RequiredState::Selected, SessionState::Authenticated) => {
                return Err(MailError::InvalidState("No mailbox selected".to_string()))
            }
            _ => {}
        }

        if spec.mutating && self.is_read_only() {
            return Err(MailError::InvalidState(format!(
                "{} not permitted, mailbox is read-only",
                spec.name
            )));
        }

        let tag = command.tag.as_str();
        let uid = command.uid;
        match ImapCommand::parse(&command)? {
            ImapCommand::Capability => {
                let mut response = Response::new();
                response
                    .untagged(format!("CAPABILITY {}", CAPABILITIES))
                    .ok(tag, "CAPABILITY completed");
                Ok(response)
            }
            ImapCommand::Noop => {
                let mut response = Response::new();
                response.ok(tag, "NOOP completed");
                Ok(response)
            }
            ImapCommand::Logout => Ok(self.logout(tag)),
            ImapCommand::Login { username, password } => {
                self.login(tag, &username, &password).await
            }
            ImapCommand::Authenticate {
                mechanism,
                initial_response,
            } => self.authenticate(tag, &mechanism, initial_response).await,
            ImapCommand::Select { mailbox } => self.select(tag, &mailbox, false).await,
            ImapCommand::Examine { mailbox } => self.select(tag, &mailbox, true).await,
            ImapCommand::List { reference, pattern } => self.list(tag, &reference, &pattern).await,
            ImapCommand::Status { mailbox, items } => self.status(tag, &mailbox, &items).await,
            ImapCommand::Append {
                mailbox,
                flags,
                message,
            } => self.append(tag, &mailbox, &flags, &message).await,
            ImapCommand::Close => self.close(tag, true).await,
            ImapCommand::Unselect => self.close(tag, false).await,
            ImapCommand::Check => {
                let mut response = Response::new();
                response.ok(tag, "CHECK completed");
                Ok(response)
            }
            ImapCommand::Fetch { sequence, items } => self.fetch(tag, uid, &sequence, &items).await,
            ImapCommand::Search { filter } => self.search(tag, uid, &filter).await,
            ImapCommand::Sort { keys, filter, .. } => self.sort(tag, uid, &keys, &filter).await,
            ImapCommand::Store {
                sequence,
                operation,
                silent,
                flags,
            } => {
                self.store(tag, uid, &sequence, operation, silent, &flags)
                    .await
            }
            ImapCommand::Expunge => self.expunge(tag).await,
            ImapCommand::Copy { sequence, mailbox } => {
                self.copy(tag, uid, &sequence, &mailbox).await
            }
        }
    }

    /// Answer to a `+` continuation issued by AUTHENTICATE
    pub async fn handle_continuation(&mut self, line: &str) -> Response {
        let mut response = Response::new();
        let Some(tag) = self.pending_auth.take() else {
            response.untagged("BAD Unexpected continuation data");
            return response;
        };

        if line.trim() == "*" {
            response.bad(&tag, "AUTHENTICATE cancelled");
            return response;
        }

        match self.finish_plain_auth(&tag, line).await {
            Ok(done) => done,
            Err(e) if e.is_bad() => {
                response.bad(&tag, e.to_string());
                response
            }
            Err(e) => {
                response.no(&tag, e.to_string());
                response
            }
        }
    }

    fn user(&self) -> Result<String> {
        self.user
            .clone()
            .ok_or_else(|| MailError::InvalidState("Must be authenticated".to_string()))
    }

    fn selected(&self) -> Result<&SelectedMailbox> {
        self.selected
            .as_ref()
            .ok_or_else(|| MailError::InvalidState("No mailbox selected".to_string()))
    }

    fn logout(&mut self, tag: &str) -> Response {
        info!(connection = %self.connection_id, "LOGOUT");
        self.state = SessionState::LoggedOut;
        self.selected = None;

        let mut response = Response::new();
        response
            .untagged("BYE IMAP4rev1 Server logging out")
            .ok(tag, "LOGOUT completed");
        response
    }

    fn authenticated(&mut self, tag: &str, username: &str, command: &str) -> Response {
        info!(connection = %self.connection_id, "{} successful for: {}", command, username);
        self.user = Some(username.to_string());
        self.state = SessionState::Authenticated;

        let mut response = Response::new();
        response.ok(tag, format!("{} completed", command));
        response
    }

    async fn login(&mut self, tag: &str, username: &str, password: &str) -> Result<Response> {
        info!(connection = %self.connection_id, "LOGIN attempt for user: {}", username);

        if self.credentials.verify(username, password).await? {
            Ok(self.authenticated(tag, username, "LOGIN"))
        } else {
            Err(MailError::AuthenticationFailed)
        }
    }

    async fn authenticate(
        &mut self,
        tag: &str,
        mechanism: &str,
        initial_response: Option<String>,
    ) -> Result<Response> {
        if mechanism != "PLAIN" {
            return Err(MailError::NotFound(format!(
                "Unsupported authentication mechanism {}",
                mechanism
            )));
        }

        match initial_response {
            Some(data) => self.finish_plain_auth(tag, &data).await,
            None => {
                self.pending_auth = Some(tag.to_string());
                let mut response = Response::new();
                response.continuation("");
                Ok(response)
            }
        }
    }

    async fn finish_plain_auth(&mut self, tag: &str, data: &str) -> Result<Response> {
        // `=` stands for an empty initial response
        let (username, password) = decode_plain_auth(if data == "=" { "" } else { data })?;
        if self.credentials.verify(&username, &password).await? {
            Ok(self.authenticated(tag, &username, "AUTHENTICATE"))
        } else {
            Err(MailError::AuthenticationFailed)
        }
    }

    async fn select(&mut self, tag: &str, name: &str, read_only: bool) -> Result<Response> {
        let user = self.user()?;
        let command = if read_only { "EXAMINE" } else { "SELECT" };

        // Any previous selection is dropped, even if this one fails
        self.selected = None;
        self.state = SessionState::Authenticated;

        info!(connection = %self.connection_id, "{} {} for user {}", command, name, user);

        let info = self
            .mailboxes
            .get_mailbox(&user, name)
            .await?
            .ok_or_else(|| MailError::NotFound(format!("Mailbox {} does not exist", name)))?;
        let items = self.emails.find(&user, name, &SearchFilter::All).await?;

        let first_unseen = items
            .iter()
            .position(|item| !item.has_flag("\\Seen"))
            .map(|index| index + 1)
            .unwrap_or(0);
        let permanent_flags = if read_only {
            "()".to_string()
        } else {
            paren_list(&info.permanent_flags)
        };

        let mut response = Response::new();
        response
            .untagged(format!("{} EXISTS", items.len()))
            .untagged(format!("{} RECENT", info.recent))
            .untagged(format!("OK [UNSEEN {}] First unseen", first_unseen))
            .untagged(format!("OK [UIDVALIDITY {}] UIDs valid", info.uid_validity))
            .untagged(format!("OK [UIDNEXT {}] Predicted next UID", info.uid_next))
            .untagged(format!("FLAGS {}", paren_list(&info.flags)))
            .untagged(format!("OK [PERMANENTFLAGS {}] Limited", permanent_flags));

        if read_only {
            response.ok(tag, "[READ-ONLY] EXAMINE completed");
        } else {
            response.ok(tag, "[READ-WRITE] SELECT completed");
        }

        self.selected = Some(SelectedMailbox {
            name: info.name,
            read_only,
            uids: items.iter().map(|item| item.uid).collect(),
        });
        self.state = SessionState::Selected;

        Ok(response)
    }

    async fn list(&self, tag: &str, reference: &str, pattern: &str) -> Result<Response> {
        let mut response = Response::new();

        if pattern.is_empty() {
            response
                .untagged(format!("LIST (\\Noselect) \"{}\" \"\"", DELIMITER))
                .ok(tag, "LIST completed");
            return Ok(response);
        }

        let user = self.user()?;
        let full_pattern = format!("{}{}", reference, pattern);
        for name in self.mailboxes.list_mailboxes(&user).await? {
            if wildcard_match(full_pattern.as_bytes(), name.as_bytes()) {
                response.untagged(format!("LIST () \"{}\" {}", DELIMITER, quote(&name)));
            }
        }
        response.ok(tag, "LIST completed");
        Ok(response)
    }

    async fn status(&self, tag: &str, name: &str, items: &[StatusItem]) -> Result<Response> {
        let user = self.user()?;
        let info = self
            .mailboxes
            .get_mailbox(&user, name)
            .await?
            .ok_or_else(|| MailError::NotFound(format!("Mailbox {} does not exist", name)))?;

        let mut values = Vec::with_capacity(items.len());
        for item in items {
            values.push(match item {
                StatusItem::Messages => {
                    format!("MESSAGES {}", self.emails.count(&user, name).await?)
                }
                StatusItem::Recent => format!("RECENT {}", info.recent),
                StatusItem::UidNext => format!("UIDNEXT {}", info.uid_next),
                StatusItem::UidValidity => format!("UIDVALIDITY {}", info.uid_validity),
                StatusItem::Unseen => format!("UNSEEN {}", info.unseen),
            });
        }

        let mut response = Response::new();
        response
            .untagged(format!("STATUS {} {}", quote(name), paren_list(&values)))
            .ok(tag, "STATUS completed");
        Ok(response)
    }

    async fn append(
        &self,
        tag: &str,
        name: &str,
        flags: &[String],
        message: &[u8],
    ) -> Result<Response> {
        let user = self.user()?;
        let info = self
            .mailboxes
            .get_mailbox(&user, name)
            .await?
            .ok_or_else(|| {
                MailError::NotFound(format!("[TRYCREATE] Mailbox {} does not exist", name))
            })?;

        let uid = self.emails.append(&user, name, flags, message).await?;
        debug!(connection = %self.connection_id, "Appended UID {} to {}", uid, name);

        let mut response = Response::new();
        response.ok(
            tag,
            format!("[APPENDUID {} {}] APPEND completed", info.uid_validity, uid),
        );
        Ok(response)
    }

    async fn close(&mut self, tag: &str, expunge: bool) -> Result<Response> {
        let selected = self.selected()?.clone();
        let command = if expunge { "CLOSE" } else { "UNSELECT" };

        if expunge && !selected.read_only {
            let user = self.user()?;
            let removed = self.emails.expunge(&user, &selected.name).await?;
            debug!(connection = %self.connection_id, "CLOSE expunged {} messages", removed.len());
        }

        self.selected = None;
        self.state = SessionState::Authenticated;

        let mut response = Response::new();
        response.ok(tag, format!("{} completed", command));
        Ok(response)
    }

    async fn fetch(
        &self,
        tag: &str,
        uid_mode: bool,
        sequence: &str,
        items: &[FetchItem],
    ) -> Result<Response> {
        let user = self.user()?;
        let selected = self.selected()?.clone();
        let targets = selected.resolve(sequence, uid_mode)?;

        let mut summaries: HashMap<u32, EmailItem> = self
            .emails
            .find(&user, &selected.name, &SearchFilter::All)
            .await?
            .into_iter()
            .map(|item| (item.uid, item))
            .collect();

        let needs_raw = items.iter().any(|item| {
            matches!(
                item,
                FetchItem::Rfc822 | FetchItem::Rfc822Header | FetchItem::Body { .. }
            )
        });
        let sets_seen = !selected.read_only && items.iter().any(FetchItem::sets_seen);

        let mut response = Response::new();
        for (seq, uid) in targets {
            let Some(mut item) = summaries.remove(&uid) else {
                continue;
            };

            let raw = if needs_raw {
                match self.emails.fetch_raw(&user, &selected.name, uid).await? {
                    Some(raw) => raw,
                    None => continue,
                }
            } else {
                Vec::new()
            };

            if sets_seen && !item.has_flag("\\Seen") {
                let seen = ["\\Seen".to_string()];
                if let Some(updated) = self
                    .emails
                    .store_flags(&user, &selected.name, &[uid], StoreOperation::Add, &seen)
                    .await?
                    .into_iter()
                    .next()
                {
                    item.flags = updated.flags;
                }
            }

            response.raw(format!("* {} FETCH (", seq).as_bytes());
            for (index, fetch_item) in items.iter().enumerate() {
                if index > 0 {
                    response.raw(b" ");
                }
                write_fetch_item(&mut response, fetch_item, &item, &raw);
            }
            response.raw(b")\r\n");
        }

        response.ok(tag, if uid_mode { "UID FETCH completed" } else { "FETCH completed" });
        Ok(response)
    }

    /// Map result items to UIDs or snapshot sequence numbers
    fn result_numbers(&self, items: &[EmailItem], uid_mode: bool) -> Result<Vec<u32>> {
        let selected = self.selected()?;
        if uid_mode {
            let known = selected.sequence_of();
            return Ok(items
                .iter()
                .map(|item| item.uid)
                .filter(|uid| known.contains_key(uid))
                .collect());
        }
        let sequence_of = selected.sequence_of();
        Ok(items
            .iter()
            .filter_map(|item| sequence_of.get(&item.uid).copied())
            .collect())
    }

    async fn search(&self, tag: &str, uid_mode: bool, filter: &SearchFilter) -> Result<Response> {
        let user = self.user()?;
        let selected = self.selected()?;
        let items = self.emails.find(&user, &selected.name, filter).await?;
        let numbers = self.result_numbers(&items, uid_mode)?;

        let mut response = Response::new();
        response
            .untagged(numbered("SEARCH", &numbers))
            .ok(tag, if uid_mode { "UID SEARCH completed" } else { "SEARCH completed" });
        Ok(response)
    }

    async fn sort(
        &self,
        tag: &str,
        uid_mode: bool,
        keys: &[SortKey],
        filter: &SearchFilter,
    ) -> Result<Response> {
        let user = self.user()?;
        let selected = self.selected()?;
        let items = self.emails.find(&user, &selected.name, filter).await?;
        let sorted = apply_sort(items, keys);
        let numbers = self.result_numbers(&sorted, uid_mode)?;

        let mut response = Response::new();
        response
            .untagged(numbered("SORT", &numbers))
            .ok(tag, if uid_mode { "UID SORT completed" } else { "SORT completed" });
        Ok(response)
    }

    async fn store(
        &self,
        tag: &str,
        uid_mode: bool,
        sequence: &str,
        operation: StoreOperation,
        silent: bool,
        flags: &[String],
    ) -> Result<Response> {
        let user = self.user()?;
        let selected = self.selected()?;
        let targets = selected.resolve(sequence, uid_mode)?;
        let uids: Vec<u32> = targets.iter().map(|(_, uid)| *uid).collect();

        let updated = self
            .emails
            .store_flags(&user, &selected.name, &uids, operation, flags)
            .await?;

        let mut response = Response::new();
        if !silent {
            let sequence_of = selected.sequence_of();
            for item in &updated {
                let Some(seq) = sequence_of.get(&item.uid) else {
                    continue;
                };
                if uid_mode {
                    response.untagged(format!(
                        "{} FETCH (UID {} FLAGS {})",
                        seq,
                        item.uid,
                        paren_list(&item.flags)
                    ));
                } else {
                    response.untagged(format!("{} FETCH (FLAGS {})", seq, paren_list(&item.flags)));
                }
            }
        }
        response.ok(tag, if uid_mode { "UID STORE completed" } else { "STORE completed" });
        Ok(response)
    }

    async fn expunge(&mut self, tag: &str) -> Result<Response> {
        let user = self.user()?;
        let name = self.selected()?.name.clone();
        let removed = self.emails.expunge(&user, &name).await?;

        let mut response = Response::new();
        if let Some(selected) = self.selected.as_mut() {
            for uid in removed {
                if let Some(index) = selected.uids.iter().position(|known| *known == uid) {
                    selected.uids.remove(index);
                    response.untagged(format!("{} EXPUNGE", index + 1));
                }
            }
        }
        response.ok(tag, "EXPUNGE completed");
        Ok(response)
    }

    async fn copy(
        &self,
        tag: &str,
        uid_mode: bool,
        sequence: &str,
        destination: &str,
    ) -> Result<Response> {
        let user = self.user()?;
        let selected = self.selected()?;
        let uids: Vec<u32> = selected
            .resolve(sequence, uid_mode)?
            .into_iter()
            .map(|(_, uid)| uid)
            .collect();

        if self.mailboxes.get_mailbox(&user, destination).await?.is_none() {
            return Err(MailError::NotFound(format!(
                "[TRYCREATE] Mailbox {} does not exist",
                destination
            )));
        }

        let copied = self
            .emails
            .copy(&user, &selected.name, &uids, destination)
            .await?;
        debug!(connection = %self.connection_id, "Copied {} messages to {}", copied, destination);

        let mut response = Response::new();
        response.ok(tag, if uid_mode { "UID COPY completed" } else { "COPY completed" });
        Ok(response)
    }
}

fn numbered(label: &str, numbers: &[u32]) -> String {
    let mut line = label.to_string();
    for number in numbers {
        line.push(' ');
        line.push_str(&number.to_string());
    }
    line
}

/// Header block of a message including the blank separator line
fn header_bytes(raw: &[u8]) -> &[u8] {
    if let Some(end) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
        return &raw[..end + 4];
    }
    if let Some(end) = raw.windows(2).position(|window| window == b"\n\n") {
        return &raw[..end + 2];
    }
    raw
}

fn write_fetch_item(response: &mut Response, fetch_item: &FetchItem, item: &EmailItem, raw: &[u8]) {
    match fetch_item {
        FetchItem::Flags => {
            response.raw(format!("FLAGS {}", paren_list(&item.flags)).as_bytes());
        }
        FetchItem::Uid => {
            response.raw(format!("UID {}", item.uid).as_bytes());
        }
        FetchItem::Rfc822Size => {
            response.raw(format!("RFC822.SIZE {}", item.size.unwrap_or(0)).as_bytes());
        }
        FetchItem::InternalDate => {
            let date = item.internal_date.unwrap_or_default();
            response.raw(
                format!("INTERNALDATE \"{}\"", date.format("%d-%b-%Y %H:%M:%S %z")).as_bytes(),
            );
        }
        FetchItem::Rfc822 => {
            response.raw(b"RFC822 ").literal(raw);
        }
        FetchItem::Rfc822Header => {
            response.raw(b"RFC822.HEADER ").literal(header_bytes(raw));
        }
        FetchItem::Body { section, .. } => match section {
            Section::Full => {
                response.raw(b"BODY[] ").literal(raw);
            }
            Section::Header => {
                response.raw(b"BODY[HEADER] ").literal(header_bytes(raw));
            }
        },
    }
}

/// LIST pattern matching: `*` matches anything, `%` stops at the delimiter
fn wildcard_match(pattern: &[u8], name: &[u8]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((b'*', rest)) => (0..=name.len()).any(|skip| wildcard_match(rest, &name[skip..])),
        Some((b'%', rest)) => (0..=name.len())
            .take_while(|&skip| skip == 0 || name[skip - 1] != DELIMITER as u8)
            .any(|skip| wildcard_match(rest, &name[skip..])),
        Some((expected, rest)) => {
            name.first() == Some(expected) && wildcard_match(rest, &name[1..])
        }
    }
}
