//! IMAP SORT criteria and ordering (RFC 5256, RFC 5957 display keys)
//!
//! The key list is folded into a single comparator: the first key decides,
//! later keys only break ties, and `REVERSE` flips just the key it precedes.
//! Sorting is stable, so items equal on every key keep their arrival order.

use crate::error::{MailError, Result};
use crate::imap::store::{Address, EmailItem};
use crate::imap::token::Token;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Arrival,
    Date,
    From,
    To,
    Cc,
    Subject,
    Size,
    DisplayFrom,
    DisplayTo,
}

impl SortField {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_uppercase().as_str() {
            "ARRIVAL" => Ok(Self::Arrival),
            "DATE" => Ok(Self::Date),
            "FROM" => Ok(Self::From),
            "TO" => Ok(Self::To),
            "CC" => Ok(Self::Cc),
            "SUBJECT" => Ok(Self::Subject),
            "SIZE" => Ok(Self::Size),
            "DISPLAYFROM" => Ok(Self::DisplayFrom),
            "DISPLAYTO" => Ok(Self::DisplayTo),
            _ => Err(MailError::InvalidSortKey(value.to_string())),
        }
    }

    fn compare(self, a: &EmailItem, b: &EmailItem) -> Ordering {
        match self {
            // `None` orders before any timestamp, so undated items sort as oldest
            SortField::Arrival => a.internal_date.cmp(&b.internal_date),
            SortField::Date => a.date.cmp(&b.date),
            SortField::From => first_email(&a.from).cmp(&first_email(&b.from)),
            SortField::To => first_email(&a.to).cmp(&first_email(&b.to)),
            SortField::Cc => first_email(&a.cc).cmp(&first_email(&b.cc)),
            SortField::DisplayFrom => first_display(&a.from).cmp(&first_display(&b.from)),
            SortField::DisplayTo => first_display(&a.to).cmp(&first_display(&b.to)),
            SortField::Subject => lowercase(a.subject.as_deref())
                .cmp(&lowercase(b.subject.as_deref())),
            SortField::Size => a.size.unwrap_or(0).cmp(&b.size.unwrap_or(0)),
        }
    }
}

fn lowercase(value: Option<&str>) -> String {
    value.unwrap_or_default().to_lowercase()
}

fn first_email(addresses: &[Address]) -> String {
    lowercase(addresses.first().map(|address| address.email.as_str()))
}

fn first_display(addresses: &[Address]) -> String {
    lowercase(addresses.first().map(Address::display))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub reverse: bool,
}

impl SortKey {
    pub fn new(field: SortField) -> Self {
        Self {
            field,
            reverse: false,
        }
    }

    pub fn reversed(field: SortField) -> Self {
        Self {
            field,
            reverse: true,
        }
    }
}

/// Parsed `SORT (keys) charset search-program` arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub keys: Vec<SortKey>,
    pub charset: String,
    /// Search program, evaluated by the store before ordering
    pub search: Vec<Token>,
}

/// Split SORT arguments into ordered keys, charset and the search program
pub fn parse_sort_spec(tokens: &[Token]) -> Result<SortSpec> {
    let mut iter = tokens.iter();

    if !iter.next().is_some_and(Token::is_paren_open) {
        return Err(MailError::MalformedCommand(
            "Expected sort criteria between parentheses".to_string(),
        ));
    }

    let mut keys = Vec::new();
    let mut reverse = false;
    loop {
        match iter.next() {
            Some(Token::ParenClose) => break,
            Some(Token::Atom(value)) if value.eq_ignore_ascii_case("REVERSE") => {
                if reverse {
                    return Err(MailError::InvalidSortKey(
                        "REVERSE must be followed by a sort key".to_string(),
                    ));
                }
                reverse = true;
            }
            Some(Token::Atom(value)) => {
                keys.push(SortKey {
                    field: SortField::parse(value)?,
                    reverse,
                });
                reverse = false;
            }
            Some(other) => {
                return Err(MailError::InvalidSortKey(other.to_string()));
            }
            None => {
                return Err(MailError::MalformedCommand(
                    "Unterminated sort criteria".to_string(),
                ))
            }
        }
    }

    if reverse {
        return Err(MailError::InvalidSortKey(
            "REVERSE must be followed by a sort key".to_string(),
        ));
    }
    if keys.is_empty() {
        return Err(MailError::MalformedCommand("Missing sort criteria".to_string()));
    }

    let charset = iter
        .next()
        .ok_or_else(|| MailError::MalformedCommand("Missing charset".to_string()))?
        .as_string()?;

    Ok(SortSpec {
        keys,
        charset,
        search: iter.cloned().collect(),
    })
}

/// Composite comparison: the first key that differs decides
pub fn compare(a: &EmailItem, b: &EmailItem, keys: &[SortKey]) -> Ordering {
    keys.iter()
        .map(|key| {
            let ordering = key.field.compare(a, b);
            if key.reverse {
                ordering.reverse()
            } else {
                ordering
            }
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Stable sort of `items` (expected in arrival order) by `keys`
pub fn apply_sort(mut items: Vec<EmailItem>, keys: &[SortKey]) -> Vec<EmailItem> {
    items.sort_by(|a, b| compare(a, b, keys));
    items
}
