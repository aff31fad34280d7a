use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::KEY_SEPARATOR;
use crate::error::MessagingError;

/// Stable participant identifier (in practice an e-mail address).
///
/// Never empty and never contains [`KEY_SEPARATOR`], so two identifiers can
/// always be joined into an unambiguous [`ConversationKey`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(value: impl Into<String>) -> Result<Self, MessagingError> {
        let value = value.into();
        if value.is_empty() {
            return Err(MessagingError::InvalidIdentifier {
                value,
                reason: "identifier is empty",
            });
        }
        if value.contains(KEY_SEPARATOR) {
            return Err(MessagingError::InvalidIdentifier {
                value,
                reason: "identifier contains the conversation key separator",
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = MessagingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

/// Order-independent key of a two-party conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Join two identifiers, lesser first.
    pub fn between(a: &Identifier, b: &Identifier) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}{}{}", lo.as_str(), KEY_SEPARATOR, hi.as_str()))
    }

    /// Accept a stored key only if it is exactly what [`Self::between`]
    /// would produce for its two participants.
    pub fn parse(value: &str) -> Result<Self, MessagingError> {
        let invalid = || MessagingError::InvalidIdentifier {
            value: value.to_string(),
            reason: "not a conversation key",
        };
        let (lo, hi) = value.split_once(KEY_SEPARATOR).ok_or_else(invalid)?;
        let key = Self::between(&Identifier::parse(lo)?, &Identifier::parse(hi)?);
        if key.as_str() != value {
            return Err(invalid());
        }
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the key back into its two participants, lesser first.
    pub fn participants(&self) -> Option<(Identifier, Identifier)> {
        let (lo, hi) = self.0.split_once(KEY_SEPARATOR)?;
        Some((Identifier::parse(lo).ok()?, Identifier::parse(hi).ok()?))
    }

    /// The participant that is not `me`, if `me` takes part at all.
    pub fn counterparty_of(&self, me: &Identifier) -> Option<Identifier> {
        let (lo, hi) = self.participants()?;
        if &lo == me {
            Some(hi)
        } else if &hi == me {
            Some(lo)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of a supervision request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Parse a stored status, accepting any letter case.
    pub fn from_stored(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    #[test]
    fn rejects_empty_and_separator() {
        assert!(matches!(
            Identifier::parse(""),
            Err(MessagingError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            Identifier::parse("a|b@uni.edu"),
            Err(MessagingError::InvalidIdentifier { .. })
        ));
        assert!(Identifier::parse("first_last@uni.edu").is_ok());
    }

    #[test]
    fn key_is_order_independent() {
        let s = id("student@uni.edu");
        let p = id("prof@uni.edu");
        assert_eq!(ConversationKey::between(&s, &p), ConversationKey::between(&p, &s));
        assert_eq!(
            ConversationKey::between(&s, &p).as_str(),
            "prof@uni.edu|student@uni.edu"
        );
    }

    #[test]
    fn key_splits_back_into_participants() {
        let s = id("student@uni.edu");
        let p = id("prof@uni.edu");
        let key = ConversationKey::between(&s, &p);
        assert_eq!(key.participants(), Some((p.clone(), s.clone())));
        assert_eq!(key.counterparty_of(&s), Some(p.clone()));
        assert_eq!(key.counterparty_of(&id("other@uni.edu")), None);
    }

    #[test]
    fn parse_accepts_only_canonical_keys() {
        let key = ConversationKey::parse("a@x.io|b@x.io").unwrap();
        assert_eq!(key.as_str(), "a@x.io|b@x.io");
        assert!(ConversationKey::parse("b@x.io|a@x.io").is_err());
        assert!(ConversationKey::parse("a@x.io").is_err());
        assert!(ConversationKey::parse("|a@x.io").is_err());
    }

    #[test]
    fn identifier_serde_validates() {
        let ok: Identifier = serde_json::from_str("\"a@b.c\"").unwrap();
        assert_eq!(ok.as_str(), "a@b.c");
        assert!(serde_json::from_str::<Identifier>("\"\"").is_err());
    }

    #[test]
    fn status_parses_legacy_capitalisation() {
        assert_eq!(RequestStatus::from_stored("Approved"), Some(RequestStatus::Approved));
        assert_eq!(RequestStatus::from_stored("pending"), Some(RequestStatus::Pending));
        assert_eq!(RequestStatus::from_stored("maybe"), None);
    }
}
