use thiserror::Error;

use crate::types::{ConversationKey, Identifier, RequestStatus};

/// Everything the messaging core can report to its caller.
///
/// Nothing here is retried automatically: each failure ends the operation
/// (or subscription) that produced it until the caller issues it again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Bad input to key resolution; fix the input and call again.
    #[error("Invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: &'static str },

    /// The live feed of a conversation broke. Resubscribe to recover.
    #[error("Feed for conversation {key} unavailable: {reason}")]
    FeedUnavailable { key: ConversationKey, reason: String },

    /// A live list of supervision requests broke. Resubscribe to recover.
    #[error("Request list of {owner} unavailable: {reason}")]
    InboxUnavailable { owner: Identifier, reason: String },

    /// Unread tracking for one counterparty broke; the others keep running.
    #[error("Unread tracking for {counterparty} failed: {reason}")]
    PartialSubscriptionFailure {
        counterparty: Identifier,
        reason: String,
    },

    /// A send, update or delete did not persist.
    #[error("Write failed during {operation}: {reason}")]
    WriteFailed {
        operation: &'static str,
        reason: String,
    },

    /// A one-shot read failed.
    #[error("Read failed during {operation}: {reason}")]
    ReadFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("Message text is empty")]
    EmptyMessage,

    #[error("Message too long: {len} characters (max {max})")]
    MessageTooLong { len: usize, max: usize },

    /// Conversations only open between an approved student/supervisor pair.
    #[error("No approved supervision between {a} and {b}")]
    NotApproved { a: Identifier, b: Identifier },

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Request is addressed to another supervisor")]
    NotAddressee,

    #[error("Request already answered ({status})")]
    AlreadyAnswered { status: RequestStatus },

    /// A stored record could not be decoded into a domain model.
    #[error("Malformed record {id}: {reason}")]
    MalformedRecord { id: String, reason: String },
}
