//! IMAP command registry and argument parsing
//!
//! The [`Receiver`](super::receiver::Receiver) yields a tag, an upper-cased
//! verb and a token list. The verb is looked up once in [`COMMANDS`] to learn
//! the minimum session state and whether it mutates the mailbox, then
//! [`ImapCommand::parse`] turns the tokens into typed arguments.

use crate::error::{MailError, Result};
use crate::imap::receiver::Command;
use crate::imap::search::SearchFilter;
use crate::imap::sort::{parse_sort_spec, SortKey};
use crate::imap::store::StoreOperation;
use crate::imap::token::Token;
use std::slice::Iter;

/// Session state a command needs before it may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredState {
    Any,
    NotAuthenticated,
    Authenticated,
    Selected,
}

/// Registry entry for one verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub state: RequiredState,
    /// Changes flags or removes messages; refused in read-only sessions
    pub mutating: bool,
    /// Accepts the `UID` prefix
    pub uid: bool,
}

const fn spec(name: &'static str, state: RequiredState, mutating: bool, uid: bool) -> CommandSpec {
    CommandSpec {
        name,
        state,
        mutating,
        uid,
    }
}

pub const COMMANDS: &[CommandSpec] = &[
    spec("CAPABILITY", RequiredState::Any, false, false),
    spec("NOOP", RequiredState::Any, false, false),
    spec("LOGOUT", RequiredState::Any, false, false),
    spec("LOGIN", RequiredState::NotAuthenticated, false, false),
    spec("AUTHENTICATE", RequiredState::NotAuthenticated, false, false),
    spec("SELECT", RequiredState::Authenticated, false, false),
    spec("EXAMINE", RequiredState::Authenticated, false, false),
    spec("LIST", RequiredState::Authenticated, false, false),
    spec("STATUS", RequiredState::Authenticated, false, false),
    spec("APPEND", RequiredState::Authenticated, false, false),
    spec("CLOSE", RequiredState::Selected, false, false),
    spec("UNSELECT", RequiredState::Selected, false, false),
    spec("CHECK", RequiredState::Selected, false, false),
    spec("FETCH", RequiredState::Selected, false, true),
    spec("SEARCH", RequiredState::Selected, false, true),
    spec("SORT", RequiredState::Selected, false, true),
    spec("STORE", RequiredState::Selected, true, true),
    spec("EXPUNGE", RequiredState::Selected, true, false),
    spec("COPY", RequiredState::Selected, false, true),
];

/// Find the registry entry for an upper-cased verb
pub fn lookup(verb: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == verb)
}

/// Body section requested by `BODY[...]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// `BODY[]`, the whole message
    Full,
    /// `BODY[HEADER]`
    Header,
}

/// One FETCH data item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchItem {
    Flags,
    Uid,
    Rfc822Size,
    InternalDate,
    Rfc822,
    Rfc822Header,
    Body { section: Section, peek: bool },
}

impl FetchItem {
    fn parse_into(name: &str, items: &mut Vec<FetchItem>) -> Result<()> {
        let upper = name.to_uppercase();
        match upper.as_str() {
            "ALL" | "FAST" => items.extend([
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
            ]),
            "FLAGS" => items.push(FetchItem::Flags),
            "UID" => items.push(FetchItem::Uid),
            "RFC822.SIZE" => items.push(FetchItem::Rfc822Size),
            "INTERNALDATE" => items.push(FetchItem::InternalDate),
            "RFC822" => items.push(FetchItem::Rfc822),
            "RFC822.HEADER" => items.push(FetchItem::Rfc822Header),
            "BODY[]" => items.push(FetchItem::Body {
                section: Section::Full,
                peek: false,
            }),
            "BODY.PEEK[]" => items.push(FetchItem::Body {
                section: Section::Full,
                peek: true,
            }),
            "BODY[HEADER]" => items.push(FetchItem::Body {
                section: Section::Header,
                peek: false,
            }),
            "BODY.PEEK[HEADER]" => items.push(FetchItem::Body {
                section: Section::Header,
                peek: true,
            }),
            _ => {
                return Err(MailError::MalformedCommand(format!(
                    "Unsupported FETCH item: {}",
                    name
                )))
            }
        }
        Ok(())
    }

    /// Whether returning this item marks the message `\Seen`
    pub fn sets_seen(&self) -> bool {
        matches!(
            self,
            FetchItem::Rfc822 | FetchItem::Body { peek: false, .. }
        )
    }
}

/// STATUS data item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
}

/// IMAP command with typed arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImapCommand {
    /// CAPABILITY - List server capabilities
    Capability,
    Noop,
    /// LOGOUT - Close connection
    Logout,
    /// LOGIN username password - Authenticate
    Login { username: String, password: String },
    /// AUTHENTICATE mechanism [initial-response]
    Authenticate {
        mechanism: String,
        initial_response: Option<String>,
    },
    /// SELECT mailbox - Select a mailbox
    Select { mailbox: String },
    /// EXAMINE mailbox - Select mailbox in read-only mode
    Examine { mailbox: String },
    /// LIST reference pattern - List mailboxes
    List { reference: String, pattern: String },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    /// APPEND mailbox [(flags)] [date] literal
    Append {
        mailbox: String,
        flags: Vec<String>,
        message: Vec<u8>,
    },
    Close,
    Unselect,
    Check,
    /// FETCH sequence items - Retrieve message data
    Fetch {
        sequence: String,
        items: Vec<FetchItem>,
    },
    /// SEARCH [CHARSET charset] criteria
    Search { filter: SearchFilter },
    /// SORT (keys) charset criteria
    Sort {
        keys: Vec<SortKey>,
        charset: String,
        filter: SearchFilter,
    },
    /// STORE sequence operation flags - Modify message flags
    Store {
        sequence: String,
        operation: StoreOperation,
        silent: bool,
        flags: Vec<String>,
    },
    /// EXPUNGE - Permanently remove messages marked \Deleted
    Expunge,
    /// COPY sequence destination - Copy messages to another mailbox
    Copy { sequence: String, mailbox: String },
}

/// Next argument as a string. Line breaks are refused: these values are
/// echoed back in response lines.
fn next_string(args: &mut Iter<'_, Token>, what: &str) -> Result<String> {
    let value = args
        .next()
        .ok_or_else(|| MailError::MalformedCommand(format!("Missing {}", what)))?
        .as_string()?;
    if value.contains(['\r', '\n', '\0']) {
        return Err(MailError::MalformedCommand(format!(
            "Line break in {}",
            what
        )));
    }
    Ok(value)
}

fn no_more(args: &mut Iter<'_, Token>) -> Result<()> {
    match args.next() {
        None => Ok(()),
        Some(token) => Err(MailError::MalformedCommand(format!(
            "Unexpected argument {}",
            token
        ))),
    }
}

/// Parse a flag list that is either parenthesized or a single flag
fn parse_flags(args: &mut Iter<'_, Token>) -> Result<Vec<String>> {
    let mut flags = Vec::new();
    match args.next() {
        Some(Token::ParenOpen) => loop {
            match args.next() {
                Some(Token::ParenClose) => break,
                Some(Token::ParenOpen) | None => {
                    return Err(MailError::MalformedCommand(
                        "Malformed flag list".to_string(),
                    ))
                }
                Some(token) => flags.push(token.as_string()?),
            }
        },
        Some(token) => {
            flags.push(token.as_string()?);
            for token in args.by_ref() {
                flags.push(token.as_string()?);
            }
        }
        None => return Err(MailError::MalformedCommand("Missing flags".to_string())),
    }
    Ok(flags)
}

impl ImapCommand {
    /// Build the typed command for a parsed line whose verb is registered
    pub fn parse(command: &Command) -> Result<Self> {
        let mut args = command.args.iter();

        let parsed = match command.verb.as_str() {
            "CAPABILITY" => ImapCommand::Capability,
            "NOOP" => ImapCommand::Noop,
            "LOGOUT" => ImapCommand::Logout,
            "CLOSE" => ImapCommand::Close,
            "UNSELECT" => ImapCommand::Unselect,
            "CHECK" => ImapCommand::Check,
            "EXPUNGE" => ImapCommand::Expunge,

            "LOGIN" => ImapCommand::Login {
                username: next_string(&mut args, "username")?,
                password: next_string(&mut args, "password")?,
            },

            "AUTHENTICATE" => ImapCommand::Authenticate {
                mechanism: next_string(&mut args, "authentication mechanism")?.to_uppercase(),
                initial_response: args.next().map(Token::as_string).transpose()?,
            },

            "SELECT" => ImapCommand::Select {
                mailbox: next_string(&mut args, "mailbox name")?,
            },

            "EXAMINE" => ImapCommand::Examine {
                mailbox: next_string(&mut args, "mailbox name")?,
            },

            "LIST" => ImapCommand::List {
                reference: next_string(&mut args, "reference")?,
                pattern: next_string(&mut args, "mailbox pattern")?,
            },

            "STATUS" => {
                let mailbox = next_string(&mut args, "mailbox name")?;
                if !args.next().is_some_and(Token::is_paren_open) {
                    return Err(MailError::MalformedCommand(
                        "STATUS requires a parenthesized item list".to_string(),
                    ));
                }
                let mut items = Vec::new();
                loop {
                    let token = args.next().ok_or_else(|| {
                        MailError::MalformedCommand("Unterminated STATUS item list".to_string())
                    })?;
                    if token.is_paren_close() {
                        break;
                    }
                    let item = match token.as_string()?.to_uppercase().as_str() {
                        "MESSAGES" => StatusItem::Messages,
                        "RECENT" => StatusItem::Recent,
                        "UIDNEXT" => StatusItem::UidNext,
                        "UIDVALIDITY" => StatusItem::UidValidity,
                        "UNSEEN" => StatusItem::Unseen,
                        other => {
                            return Err(MailError::MalformedCommand(format!(
                                "Unknown STATUS item: {}",
                                other
                            )))
                        }
                    };
                    items.push(item);
                }
                ImapCommand::Status { mailbox, items }
            }

            "APPEND" => {
                let mailbox = next_string(&mut args, "mailbox name")?;
                let rest: Vec<Token> = args.by_ref().cloned().collect();
                let (message, options) = rest.split_last().ok_or_else(|| {
                    MailError::MalformedCommand("APPEND requires a message literal".to_string())
                })?;
                if message.is_paren_close() || message.is_paren_open() {
                    return Err(MailError::MalformedCommand(
                        "APPEND requires a message literal".to_string(),
                    ));
                }

                // Optional flag list, then an optional date-time we ignore
                let mut flags = Vec::new();
                let mut options = options.iter();
                if options.as_slice().first().is_some_and(Token::is_paren_open) {
                    flags = parse_flags(&mut options)?;
                }
                if options.len() > 1 {
                    return Err(MailError::MalformedCommand(
                        "Too many APPEND arguments".to_string(),
                    ));
                }

                ImapCommand::Append {
                    mailbox,
                    flags,
                    message: message.clone().into_bytes()?,
                }
            }

            "FETCH" => {
                let sequence = next_string(&mut args, "message set")?;
                let mut items = Vec::new();
                match args.next() {
                    Some(Token::ParenOpen) => loop {
                        match args.next() {
                            Some(Token::ParenClose) => break,
                            Some(Token::Atom(name)) => FetchItem::parse_into(name, &mut items)?,
                            _ => {
                                return Err(MailError::MalformedCommand(
                                    "Malformed FETCH item list".to_string(),
                                ))
                            }
                        }
                    },
                    Some(Token::Atom(name)) => FetchItem::parse_into(name, &mut items)?,
                    _ => {
                        return Err(MailError::MalformedCommand(
                            "FETCH requires data items".to_string(),
                        ))
                    }
                }
                if items.is_empty() {
                    return Err(MailError::MalformedCommand(
                        "FETCH requires data items".to_string(),
                    ));
                }
                if command.uid && !items.contains(&FetchItem::Uid) {
                    items.insert(0, FetchItem::Uid);
                }
                ImapCommand::Fetch { sequence, items }
            }

            "SEARCH" => {
                let mut tokens = command.args.as_slice();
                if tokens.first().is_some_and(|token| token.is_atom("CHARSET")) {
                    let charset = tokens
                        .get(1)
                        .ok_or_else(|| MailError::MalformedCommand("Missing charset".to_string()))?
                        .as_string()?;
                    check_charset(&charset)?;
                    tokens = &tokens[2..];
                }
                return Ok(ImapCommand::Search {
                    filter: SearchFilter::parse(tokens)?,
                });
            }

            "SORT" => {
                let spec = parse_sort_spec(&command.args)?;
                check_charset(&spec.charset)?;
                return Ok(ImapCommand::Sort {
                    filter: SearchFilter::parse(&spec.search)?,
                    keys: spec.keys,
                    charset: spec.charset,
                });
            }

            "STORE" => {
                let sequence = next_string(&mut args, "message set")?;
                let item = next_string(&mut args, "STORE data item")?.to_uppercase();
                let (operation, rest) = match item.as_bytes().first() {
                    Some(b'+') => (StoreOperation::Add, &item[1..]),
                    Some(b'-') => (StoreOperation::Remove, &item[1..]),
                    _ => (StoreOperation::Replace, item.as_str()),
                };
                let silent = match rest {
                    "FLAGS" => false,
                    "FLAGS.SILENT" => true,
                    _ => {
                        return Err(MailError::MalformedCommand(format!(
                            "Unknown STORE data item: {}",
                            item
                        )))
                    }
                };
                ImapCommand::Store {
                    sequence,
                    operation,
                    silent,
                    flags: parse_flags(&mut args)?,
                }
            }

            "COPY" => ImapCommand::Copy {
                sequence: next_string(&mut args, "message set")?,
                mailbox: next_string(&mut args, "destination mailbox")?,
            },

            other => {
                return Err(MailError::MalformedCommand(format!(
                    "Unknown command: {}",
                    other
                )))
            }
        };

        no_more(&mut args)?;
        Ok(parsed)
    }
}

/// Charsets accepted for SEARCH and SORT
pub const SUPPORTED_CHARSETS: [&str; 2] = ["UTF-8", "US-ASCII"];

/// Reject charsets other than [`SUPPORTED_CHARSETS`]
pub fn check_charset(charset: &str) -> Result<()> {
    if SUPPORTED_CHARSETS
        .iter()
        .any(|supported| supported.eq_ignore_ascii_case(charset))
    {
        Ok(())
    } else {
        Err(MailError::NotFound(format!(
            "[BADCHARSET ({})] Unsupported charset {}",
            SUPPORTED_CHARSETS.join(" "),
            charset
        )))
    }
}
