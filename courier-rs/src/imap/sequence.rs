//! IMAP sequence-set expansion
//!
//! `1,3:5,*` against a mailbox of 10 messages expands to `[1, 3, 4, 5, 10]`.

use crate::error::{MailError, Result};
use std::collections::BTreeSet;

fn parse_bound(value: &str, max_message: u32, set_expr: &str) -> Result<u32> {
    if value == "*" {
        return Ok(max_message);
    }
    match value.parse::<u32>() {
        Ok(number) if number > 0 => Ok(number),
        _ => Err(MailError::InvalidMessageSet(format!(
            "{:?} in {:?}",
            value, set_expr
        ))),
    }
}

/// Expand a sequence set into sorted, deduplicated numbers in `1..=max_message`.
///
/// `*` resolves to `max_message`. Range bounds may be given in either order.
/// Numbers above `max_message` are dropped.
pub fn parse_message_set(set_expr: &str, max_message: u32) -> Result<Vec<u32>> {
    if set_expr.is_empty() {
        return Err(MailError::InvalidMessageSet("empty set".to_string()));
    }

    let mut numbers = BTreeSet::new();

    for element in set_expr.split(',') {
        match element.split_once(':') {
            Some((start, end)) => {
                let start = parse_bound(start, max_message, set_expr)?;
                let end = parse_bound(end, max_message, set_expr)?;
                let (low, high) = if start <= end { (start, end) } else { (end, start) };
                numbers.extend(low.max(1)..=high.min(max_message));
            }
            None => {
                let number = parse_bound(element, max_message, set_expr)?;
                if (1..=max_message).contains(&number) {
                    numbers.insert(number);
                }
            }
        }
    }

    Ok(numbers.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_set() {
        assert_eq!(parse_message_set("1,3:5,*", 10).unwrap(), vec![1, 3, 4, 5, 10]);
    }

    #[test]
    fn test_reversed_range_and_wildcard() {
        assert_eq!(parse_message_set("*:8", 10).unwrap(), vec![8, 9, 10]);
        assert_eq!(parse_message_set("4:2", 10).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_overlaps_collapse() {
        assert_eq!(parse_message_set("1:3,2:4,3", 10).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_clipped_to_max() {
        assert_eq!(parse_message_set("5:20", 7).unwrap(), vec![5, 6, 7]);
        assert_eq!(parse_message_set("9", 7).unwrap(), Vec::<u32>::new());
        assert_eq!(parse_message_set("1:*", 0).unwrap(), Vec::<u32>::new());
        assert_eq!(parse_message_set("*", 0).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_invalid_atoms() {
        for input in ["", "a", "1,,2", "1:b", "0", "-1", "1:2:3"] {
            let err = parse_message_set(input, 10).unwrap_err();
            assert!(matches!(err, MailError::InvalidMessageSet(_)), "{}", input);
        }
    }
}
