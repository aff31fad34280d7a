//! Domain models decoded from store records.
//!
//! Every struct derives `Serialize` so it can be handed directly to the UI
//! layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use tutorlink_shared::constants::fields as f;
use tutorlink_shared::{ConversationKey, Identifier, MessagingError, RequestStatus};
use tutorlink_store::{Fields, Record, RecordId, Value};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One chat message of a two-party conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: RecordId,
    pub conversation_key: ConversationKey,
    pub sender_id: Identifier,
    /// Absent on messages written by older clients.
    pub receiver_id: Option<Identifier>,
    pub text: String,
    /// `None` until the store has assigned the commit time.
    pub created_at: Option<DateTime<Utc>>,
    pub read: bool,
}

impl Message {
    /// Field map for a new, unread message stamped by the store.
    pub(crate) fn new_fields(
        key: &ConversationKey,
        from: &Identifier,
        to: &Identifier,
        text: &str,
    ) -> Fields {
        Fields::from([
            (f::CONVERSATION_KEY.to_string(), Value::from(key)),
            (f::SENDER_ID.to_string(), Value::from(from)),
            (f::RECEIVER_ID.to_string(), Value::from(to)),
            (f::TEXT.to_string(), Value::from(text)),
            (f::CREATED_AT.to_string(), Value::ServerTimestamp),
            (f::READ.to_string(), Value::Bool(false)),
        ])
    }

    pub fn from_record(record: &Record) -> Result<Self, MessagingError> {
        let key = required_text(record, f::CONVERSATION_KEY)?;
        let conversation_key =
            ConversationKey::parse(key).map_err(|e| malformed(record, e.to_string()))?;
        let sender_id = identifier(record, f::SENDER_ID)?;
        let receiver_id = match record.text(f::RECEIVER_ID) {
            Some(raw) => {
                Some(Identifier::parse(raw).map_err(|e| malformed(record, e.to_string()))?)
            }
            None => None,
        };

        Ok(Self {
            id: record.id.clone(),
            conversation_key,
            sender_id,
            receiver_id,
            text: record.text(f::TEXT).unwrap_or_default().to_string(),
            created_at: record.timestamp(f::CREATED_AT),
            read: record.bool(f::READ).unwrap_or(false),
        })
    }

    /// Whether `who` is the author.
    pub fn is_from(&self, who: &Identifier) -> bool {
        &self.sender_id == who
    }
}

// ---------------------------------------------------------------------------
// SupervisionRequest
// ---------------------------------------------------------------------------

/// A student's request to be supervised, and the supervisor's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisionRequest {
    pub id: RecordId,
    pub student_id: Identifier,
    pub supervisor_id: Identifier,
    pub note: String,
    pub status: RequestStatus,
    pub supervisor_comment: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl SupervisionRequest {
    pub(crate) fn new_fields(student: &Identifier, supervisor: &Identifier, note: &str) -> Fields {
        Fields::from([
            (f::STUDENT_ID.to_string(), Value::from(student)),
            (f::SUPERVISOR_ID.to_string(), Value::from(supervisor)),
            (f::NOTE.to_string(), Value::from(note)),
            (f::STATUS.to_string(), Value::from(RequestStatus::Pending.as_str())),
            (f::CREATED_AT.to_string(), Value::ServerTimestamp),
        ])
    }

    pub fn from_record(record: &Record) -> Result<Self, MessagingError> {
        let status_raw = required_text(record, f::STATUS)?;
        let status = RequestStatus::from_stored(status_raw)
            .ok_or_else(|| malformed(record, format!("unknown status {status_raw:?}")))?;

        Ok(Self {
            id: record.id.clone(),
            student_id: identifier(record, f::STUDENT_ID)?,
            supervisor_id: identifier(record, f::SUPERVISOR_ID)?,
            note: record.text(f::NOTE).unwrap_or_default().to_string(),
            status,
            supervisor_comment: record.text(f::COMMENT).map(str::to_string),
            created_at: record.timestamp(f::CREATED_AT),
        })
    }
}

// ---------------------------------------------------------------------------
// Decoding helpers
// ---------------------------------------------------------------------------

fn malformed(record: &Record, reason: String) -> MessagingError {
    MessagingError::MalformedRecord {
        id: record.id.to_string(),
        reason,
    }
}

fn required_text<'r>(record: &'r Record, field: &str) -> Result<&'r str, MessagingError> {
    record
        .text(field)
        .ok_or_else(|| malformed(record, format!("missing text field {field}")))
}

fn identifier(record: &Record, field: &str) -> Result<Identifier, MessagingError> {
    Identifier::parse(required_text(record, field)?).map_err(|e| malformed(record, e.to_string()))
}

/// Decode a snapshot, skipping records that do not decode.
pub(crate) fn decode_all<T>(
    records: &[Record],
    decode: impl Fn(&Record) -> Result<T, MessagingError>,
) -> Vec<T> {
    records
        .iter()
        .filter_map(|r| match decode(r) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}
