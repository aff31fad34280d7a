//! Conversation identity resolution.

use tutorlink_shared::{ConversationKey, Identifier, MessagingError};

/// Derive the conversation key shared by two participants.
///
/// The result does not depend on argument order. Fails with
/// [`MessagingError::InvalidIdentifier`] if either side is empty or contains
/// the key separator.
pub fn resolve_key(a: &str, b: &str) -> Result<ConversationKey, MessagingError> {
    let a = Identifier::parse(a)?;
    let b = Identifier::parse(b)?;
    Ok(ConversationKey::between(&a, &b))
}
