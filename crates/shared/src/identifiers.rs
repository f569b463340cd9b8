//! Login identifiers and membership identifier generation
//!
//! A member can sign in with their email, their username or their
//! membership identifier (`TP-A` followed by eight digits).

use rand::Rng;

const MEMBERSHIP_ID_PREFIX: &str = "TP-A";
const MEMBERSHIP_ID_DIGITS: usize = 8;

/// What kind of value a caller supplied as their login identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Email(String),
    MembershipId(String),
    Username(String),
}

impl Identifier {
    /// Classify a raw login identifier
    ///
    /// Emails are lowercased and membership identifiers uppercased so lookups
    /// are case-insensitive; usernames are only trimmed.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if is_membership_id(trimmed) {
            Identifier::MembershipId(trimmed.to_ascii_uppercase())
        } else if trimmed.contains('@') {
            Identifier::Email(trimmed.to_ascii_lowercase())
        } else {
            Identifier::Username(trimmed.to_string())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Identifier::Email(_) => "email",
            Identifier::MembershipId(_) => "membership_id",
            Identifier::Username(_) => "username",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Identifier::Email(v) | Identifier::MembershipId(v) | Identifier::Username(v) => v,
        }
    }
}

/// `TP-A########`, case-insensitive on the prefix
pub fn is_membership_id(value: &str) -> bool {
    let upper = value.to_ascii_uppercase();
    match upper.strip_prefix(MEMBERSHIP_ID_PREFIX) {
        Some(digits) => {
            digits.len() == MEMBERSHIP_ID_DIGITS && digits.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Random membership identifier; uniqueness is enforced by the
/// `members.membership_id` constraint and `MemberService::register` draws
/// again on conflict.
pub fn generate_membership_id() -> String {
    let number: u32 = rand::rng().random_range(0..100_000_000);
    format!("{}{:08}", MEMBERSHIP_ID_PREFIX, number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_id_shape() {
        for _ in 0..50 {
            let id = generate_membership_id();
            assert_eq!(id.len(), 12);
            assert!(is_membership_id(&id), "{} should validate", id);
        }
    }

    #[test]
    fn test_membership_id_rejects_malformed() {
        assert!(!is_membership_id("TP-A1234567"));
        assert!(!is_membership_id("TP-A123456789"));
        assert!(!is_membership_id("TP-B12345678"));
        assert!(!is_membership_id("TP-A1234567x"));
        assert!(is_membership_id("tp-a12345678"));
    }

    #[test]
    fn test_identifier_classification() {
        assert_eq!(
            Identifier::parse(" Ada@Example.com "),
            Identifier::Email("ada@example.com".to_string())
        );
        assert_eq!(
            Identifier::parse("tp-a00001234"),
            Identifier::MembershipId("TP-A00001234".to_string())
        );
        assert_eq!(
            Identifier::parse("ada_planner"),
            Identifier::Username("ada_planner".to_string())
        );
        assert_eq!(Identifier::parse("ada_planner").kind(), "username");
    }
}
