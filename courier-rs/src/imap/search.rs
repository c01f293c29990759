//! IMAP SEARCH program parsing and evaluation

use crate::error::{MailError, Result};
use crate::imap::store::{Address, EmailItem};
use crate::imap::token::Token;
use std::iter::Peekable;
use std::slice::Iter;

/// Search criteria for IMAP SEARCH and SORT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFilter {
    /// ALL - All messages
    All,
    Seen,
    Unseen,
    Flagged,
    Unflagged,
    Deleted,
    Undeleted,
    Answered,
    Unanswered,
    Draft,
    /// SUBJECT string - Messages with string in subject
    Subject(String),
    /// FROM string - Messages from sender
    From(String),
    /// TO string - Messages to recipient
    To(String),
    Cc(String),
    Body(String),
    /// TEXT string - Messages with string in body or headers
    Text(String),
    Larger(u64),
    Smaller(u64),
    Not(Box<SearchFilter>),
    Or(Box<SearchFilter>, Box<SearchFilter>),
    And(Vec<SearchFilter>),
}

impl SearchFilter {
    /// Parse a search program. An empty program means ALL; several keys are
    /// implicitly ANDed.
    pub fn parse(tokens: &[Token]) -> Result<Self> {
        let mut iter = tokens.iter().peekable();
        let mut keys = Vec::new();
        while iter.peek().is_some() {
            keys.push(Self::parse_key(&mut iter)?);
        }
        Ok(match keys.len() {
            0 => SearchFilter::All,
            1 => keys.remove(0),
            _ => SearchFilter::And(keys),
        })
    }

    fn parse_key(iter: &mut Peekable<Iter<'_, Token>>) -> Result<Self> {
        let token = iter
            .next()
            .ok_or_else(|| MailError::MalformedCommand("Missing search key".to_string()))?;

        let keyword = match token {
            Token::ParenOpen => {
                let mut keys = Vec::new();
                loop {
                    match iter.peek() {
                        Some(Token::ParenClose) => {
                            iter.next();
                            break;
                        }
                        Some(_) => keys.push(Self::parse_key(iter)?),
                        None => {
                            return Err(MailError::MalformedCommand(
                                "Unbalanced parentheses in search program".to_string(),
                            ))
                        }
                    }
                }
                return match keys.len() {
                    0 => Err(MailError::MalformedCommand("Empty search group".to_string())),
                    1 => Ok(keys.remove(0)),
                    _ => Ok(SearchFilter::And(keys)),
                };
            }
            Token::Atom(value) => value.to_uppercase(),
            other => {
                return Err(MailError::MalformedCommand(format!(
                    "Unexpected search argument {}",
                    other
                )))
            }
        };

        let filter = match keyword.as_str() {
            "ALL" => SearchFilter::All,
            "SEEN" => SearchFilter::Seen,
            "UNSEEN" => SearchFilter::Unseen,
            "FLAGGED" => SearchFilter::Flagged,
            "UNFLAGGED" => SearchFilter::Unflagged,
            "DELETED" => SearchFilter::Deleted,
            "UNDELETED" => SearchFilter::Undeleted,
            "ANSWERED" => SearchFilter::Answered,
            "UNANSWERED" => SearchFilter::Unanswered,
            "DRAFT" => SearchFilter::Draft,
            "SUBJECT" => SearchFilter::Subject(Self::string_arg(iter, &keyword)?),
            "FROM" => SearchFilter::From(Self::string_arg(iter, &keyword)?),
            "TO" => SearchFilter::To(Self::string_arg(iter, &keyword)?),
            "CC" => SearchFilter::Cc(Self::string_arg(iter, &keyword)?),
            "BODY" => SearchFilter::Body(Self::string_arg(iter, &keyword)?),
            "TEXT" => SearchFilter::Text(Self::string_arg(iter, &keyword)?),
            "LARGER" => SearchFilter::Larger(Self::number_arg(iter, &keyword)?),
            "SMALLER" => SearchFilter::Smaller(Self::number_arg(iter, &keyword)?),
            "NOT" => SearchFilter::Not(Box::new(Self::parse_key(iter)?)),
            "OR" => {
                let left = Self::parse_key(iter)?;
                let right = Self::parse_key(iter)?;
                SearchFilter::Or(Box::new(left), Box::new(right))
            }
            _ => {
                return Err(MailError::MalformedCommand(format!(
                    "Unknown search criterion: {}",
                    keyword
                )))
            }
        };

        Ok(filter)
    }

    fn string_arg(iter: &mut Peekable<Iter<'_, Token>>, keyword: &str) -> Result<String> {
        iter.next()
            .ok_or_else(|| {
                MailError::MalformedCommand(format!("{} requires a search string", keyword))
            })?
            .as_string()
    }

    fn number_arg(iter: &mut Peekable<Iter<'_, Token>>, keyword: &str) -> Result<u64> {
        Self::string_arg(iter, keyword)?
            .parse()
            .map_err(|_| MailError::MalformedCommand(format!("{} requires a number", keyword)))
    }

    /// Evaluate the filter against a message summary and its raw content
    pub fn matches(&self, item: &EmailItem, raw: &[u8]) -> bool {
        match self {
            SearchFilter::All => true,
            SearchFilter::Seen => item.has_flag("\\Seen"),
            SearchFilter::Unseen => !item.has_flag("\\Seen"),
            SearchFilter::Flagged => item.has_flag("\\Flagged"),
            SearchFilter::Unflagged => !item.has_flag("\\Flagged"),
            SearchFilter::Deleted => item.has_flag("\\Deleted"),
            SearchFilter::Undeleted => !item.has_flag("\\Deleted"),
            SearchFilter::Answered => item.has_flag("\\Answered"),
            SearchFilter::Unanswered => !item.has_flag("\\Answered"),
            SearchFilter::Draft => item.has_flag("\\Draft"),
            SearchFilter::Subject(query) => item
                .subject
                .as_deref()
                .is_some_and(|subject| contains_ignore_case(subject, query)),
            SearchFilter::From(query) => addresses_match(&item.from, query),
            SearchFilter::To(query) => addresses_match(&item.to, query),
            SearchFilter::Cc(query) => addresses_match(&item.cc, query),
            SearchFilter::Body(query) => {
                let text = String::from_utf8_lossy(raw);
                let body = text
                    .find("\r\n\r\n")
                    .map(|end| &text[end + 4..])
                    .or_else(|| text.find("\n\n").map(|end| &text[end + 2..]))
                    .unwrap_or("");
                contains_ignore_case(body, query)
            }
            SearchFilter::Text(query) => contains_ignore_case(&String::from_utf8_lossy(raw), query),
            SearchFilter::Larger(size) => item.size.unwrap_or(0) > *size,
            SearchFilter::Smaller(size) => item.size.unwrap_or(0) < *size,
            SearchFilter::Not(inner) => !inner.matches(item, raw),
            SearchFilter::Or(left, right) => left.matches(item, raw) || right.matches(item, raw),
            SearchFilter::And(keys) => keys.iter().all(|key| key.matches(item, raw)),
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn addresses_match(addresses: &[Address], query: &str) -> bool {
    addresses.iter().any(|address| {
        contains_ignore_case(&address.email, query)
            || address
                .name
                .as_deref()
                .is_some_and(|name| contains_ignore_case(name, query))
    })
}
