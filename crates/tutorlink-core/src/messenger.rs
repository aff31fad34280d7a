//! Entry point of the messaging core.
//!
//! A [`Messenger`] wraps a shared [`DocumentStore`] handle. Sending, marking
//! read and clearing live here; subscriptions and supervision requests add
//! their own `impl` blocks in their modules.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use tutorlink_shared::constants::{fields as f, MAX_MESSAGE_CHARS, MESSAGES_COLLECTION};
use tutorlink_shared::{ConversationKey, Identifier, MessagingError};
use tutorlink_store::{DocumentStore, Fields, Query, RecordId, StoreError, Value};

use crate::models::Message;

/// Tunables passed to a [`Messenger`].
#[derive(Debug, Clone)]
pub struct MessagingOptions {
    /// Longest accepted message, in characters after trimming.
    pub max_message_chars: usize,
}

impl Default for MessagingOptions {
    fn default() -> Self {
        Self {
            max_message_chars: MAX_MESSAGE_CHARS,
        }
    }
}

pub struct Messenger<S> {
    pub(crate) store: Arc<S>,
    pub(crate) options: MessagingOptions,
}

impl<S> Clone for Messenger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S: DocumentStore> Messenger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_options(store, MessagingOptions::default())
    }

    pub fn with_options(store: Arc<S>, options: MessagingOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn options(&self) -> &MessagingOptions {
        &self.options
    }

    /// Send `text` from `from` to `to`. The conversation comes into existence
    /// with its first message.
    pub async fn send_message(
        &self,
        from: &Identifier,
        to: &Identifier,
        text: &str,
    ) -> Result<RecordId, MessagingError> {
        if from == to {
            return Err(MessagingError::InvalidIdentifier {
                value: to.to_string(),
                reason: "cannot message yourself",
            });
        }
        let text = self.validate_text(text)?;
        let key = ConversationKey::between(from, to);

        let id = self
            .store
            .add_record(MESSAGES_COLLECTION, Message::new_fields(&key, from, to, text))
            .await
            .map_err(write_failed("send_message"))?;

        debug!(conversation = %key, id = %id, "message sent");
        Ok(id)
    }

    /// Mark as read every unread message of the conversation that `reader`
    /// did not write and that was committed at or before `up_to`. Returns how
    /// many messages changed.
    ///
    /// Works on the raw records, like the unread counts do, so a message
    /// that does not decode still gets marked read.
    ///
    /// Nothing calls this automatically; the caller decides when a message
    /// counts as seen.
    pub async fn mark_read(
        &self,
        key: &ConversationKey,
        reader: &Identifier,
        up_to: DateTime<Utc>,
    ) -> Result<usize, MessagingError> {
        let query = Query::collection(MESSAGES_COLLECTION)
            .where_eq(f::CONVERSATION_KEY, key)
            .where_eq(f::READ, false);
        let records = self
            .store
            .fetch(&query)
            .await
            .map_err(read_failed("mark_read"))?;

        let updates: Vec<(RecordId, Fields)> = records
            .into_iter()
            .filter(|r| r.text(f::SENDER_ID) != Some(reader.as_str()))
            .filter(|r| r.timestamp(f::CREATED_AT).is_some_and(|ts| ts <= up_to))
            .map(|r| (r.id, Fields::from([(f::READ.to_string(), Value::Bool(true))])))
            .collect();

        if updates.is_empty() {
            return Ok(0);
        }

        let marked = self
            .store
            .batch_update(MESSAGES_COLLECTION, updates)
            .await
            .map_err(write_failed("mark_read"))?;

        debug!(conversation = %key, reader = %reader, marked, "messages marked read");
        Ok(marked)
    }

    /// Delete every message of a conversation in one atomic batch. Returns
    /// how many messages were removed.
    pub async fn clear_conversation(&self, key: &ConversationKey) -> Result<usize, MessagingError> {
        let query = Query::collection(MESSAGES_COLLECTION).where_eq(f::CONVERSATION_KEY, key);
        let ids: Vec<RecordId> = self
            .store
            .fetch(&query)
            .await
            .map_err(read_failed("clear_conversation"))?
            .into_iter()
            .map(|r| r.id)
            .collect();

        if ids.is_empty() {
            return Ok(0);
        }

        let removed = self
            .store
            .batch_delete(MESSAGES_COLLECTION, &ids)
            .await
            .map_err(write_failed("clear_conversation"))?;

        info!(conversation = %key, removed, "conversation cleared");
        Ok(removed)
    }

    fn validate_text<'t>(&self, text: &'t str) -> Result<&'t str, MessagingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MessagingError::EmptyMessage);
        }
        let len = text.chars().count();
        if len > self.options.max_message_chars {
            return Err(MessagingError::MessageTooLong {
                len,
                max: self.options.max_message_chars,
            });
        }
        Ok(text)
    }
}

pub(crate) fn write_failed(operation: &'static str) -> impl Fn(StoreError) -> MessagingError {
    move |e| MessagingError::WriteFailed {
        operation,
        reason: e.to_string(),
    }
}

pub(crate) fn read_failed(operation: &'static str) -> impl Fn(StoreError) -> MessagingError {
    move |e| MessagingError::ReadFailed {
        operation,
        reason: e.to_string(),
    }
}
