//! IMAP argument tokens and string quoting

use crate::error::{MailError, Result};
use std::fmt;

/// A single argument produced by the [`Receiver`](super::receiver::Receiver)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bare word, e.g. `INBOX` or `\Seen`
    Atom(String),
    /// Content of a `"..."` string with escapes removed
    Quoted(String),
    /// Exactly the bytes announced by a `{N}` marker
    Literal(Vec<u8>),
    /// `(`
    ParenOpen,
    /// `)`
    ParenClose,
}

impl Token {
    /// String value of an atom, quoted string or UTF-8 literal
    pub fn as_string(&self) -> Result<String> {
        match self {
            Token::Atom(value) | Token::Quoted(value) => Ok(value.clone()),
            Token::Literal(bytes) => String::from_utf8(bytes.clone())
                .map_err(|_| MailError::MalformedCommand("Literal is not valid UTF-8".to_string())),
            Token::ParenOpen | Token::ParenClose => Err(MailError::MalformedCommand(
                "Expected a string, found a parenthesis".to_string(),
            )),
        }
    }

    /// Raw bytes carried by a string-like token
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Token::Atom(value) | Token::Quoted(value) => Ok(value.into_bytes()),
            Token::Literal(bytes) => Ok(bytes),
            Token::ParenOpen | Token::ParenClose => Err(MailError::MalformedCommand(
                "Expected a string, found a parenthesis".to_string(),
            )),
        }
    }

    /// Case-insensitive comparison against an atom
    pub fn is_atom(&self, expected: &str) -> bool {
        matches!(self, Token::Atom(value) if value.eq_ignore_ascii_case(expected))
    }

    pub fn is_paren_open(&self) -> bool {
        matches!(self, Token::ParenOpen)
    }

    pub fn is_paren_close(&self) -> bool {
        matches!(self, Token::ParenClose)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Atom(value) => f.write_str(value),
            Token::Quoted(value) => f.write_str(&quote(value)),
            Token::Literal(bytes) => write!(f, "{{{}}}", bytes.len()),
            Token::ParenOpen => f.write_str("("),
            Token::ParenClose => f.write_str(")"),
        }
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|ch| ch.is_whitespace() || matches!(ch, '(' | ')' | '\\' | '"'))
}

/// Serialize a string for the wire, quoting it only when required.
pub fn quote(value: &str) -> String {
    if !needs_quoting(value) {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if ch == '\\' || ch == '"' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Inverse of [`quote`]: strips surrounding quotes and resolves escapes.
/// Unquoted input is returned as-is.
pub fn unquote(value: &str) -> String {
    let inner = match value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) if value.len() >= 2 => inner,
        _ => return value.to_string(),
    };

    let mut unquoted = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            unquoted.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            unquoted.push(ch);
        }
    }
    unquoted
}
