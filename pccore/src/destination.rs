//! Routing of a dialed destination to the peer or the gateway transport.

use serde::Serialize;
use thiserror::Error;

use crate::types::TransportKind;

const PEER_PREFIX: &str = "peer:";
const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;
const MAX_PEER_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestinationError {
    #[error("destination is empty")]
    Empty,
    #[error("unrecognized destination format: {0}")]
    Unrecognized(String),
}

/// A validated call destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Destination {
    /// Identifier routable through direct peer negotiation.
    Peer(String),
    /// Phone number for the gateway, normalized to `+?digits`.
    Phone(String),
}

impl Destination {
    pub fn parse(raw: &str) -> Result<Self, DestinationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DestinationError::Empty);
        }

        if let Some(id) = trimmed.strip_prefix(PEER_PREFIX) {
            return if is_peer_id(id) {
                Ok(Self::Peer(id.to_string()))
            } else {
                Err(DestinationError::Unrecognized(raw.to_string()))
            };
        }

        if let Some(phone) = normalize_phone(trimmed) {
            return Ok(Self::Phone(phone));
        }

        if is_peer_id(trimmed) {
            return Ok(Self::Peer(trimmed.to_string()));
        }

        Err(DestinationError::Unrecognized(raw.to_string()))
    }

    pub fn transport(&self) -> TransportKind {
        match self {
            Self::Peer(_) => TransportKind::Peer,
            Self::Phone(_) => TransportKind::Gateway,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Peer(id) | Self::Phone(id) => id,
        }
    }
}

/// Peer ids start with a letter, followed by 2..=63 of `[A-Za-z0-9_.-]`.
fn is_peer_id(id: &str) -> bool {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (3..=MAX_PEER_ID_LEN).contains(&id.len())
        && first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn normalize_phone(raw: &str) -> Option<String> {
    let (plus, rest) = match raw.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return None,
        }
    }
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return None;
    }
    Some(if plus { format!("+{digits}") } else { digits })
}

/// DTMF digits the gateway accepts.
pub fn is_dtmf_digit(digit: char) -> bool {
    matches!(digit, '0'..='9' | '*' | '#' | 'A'..='D')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phone_numbers_route_to_gateway() {
        let dest = Destination::parse("+1 (555) 123-4567").unwrap();
        assert_eq!(dest, Destination::Phone("+15551234567".into()));
        assert_eq!(dest.transport(), TransportKind::Gateway);

        assert_eq!(
            Destination::parse("555.123.4567").unwrap(),
            Destination::Phone("5551234567".into())
        );
    }

    #[test]
    fn test_peer_ids_route_to_peer() {
        let dest = Destination::parse("alice_01").unwrap();
        assert_eq!(dest, Destination::Peer("alice_01".into()));
        assert_eq!(dest.transport(), TransportKind::Peer);

        // An explicit prefix wins even for digit-heavy ids.
        assert_eq!(
            Destination::parse("peer:bob.smith").unwrap(),
            Destination::Peer("bob.smith".into())
        );
    }

    #[test]
    fn test_rejects_bad_formats() {
        assert_eq!(Destination::parse("   "), Err(DestinationError::Empty));
        assert!(Destination::parse("12345").is_err());
        assert!(Destination::parse("1234567890123456").is_err());
        assert!(Destination::parse("ab").is_err());
        assert!(Destination::parse("9lives").is_err());
        assert!(Destination::parse("peer:").is_err());
        assert!(Destination::parse("alice bob").is_err());
        assert!(Destination::parse("+1 555 abc 4567").is_err());
    }

    #[test]
    fn test_dtmf_digits() {
        for d in "0123456789*#ABCD".chars() {
            assert!(is_dtmf_digit(d));
        }
        assert!(!is_dtmf_digit('E'));
        assert!(!is_dtmf_digit('a'));
    }
}
