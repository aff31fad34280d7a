//! Supervision requests.
//!
//! A student asks a supervisor for supervision; the supervisor approves or
//! rejects with an optional comment. Conversations only open between an
//! approved pair. Each decision is also appended to the responses log.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{ready, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use tutorlink_shared::constants::{fields as f, REQUESTS_COLLECTION, RESPONSES_COLLECTION};
use tutorlink_shared::{ConversationKey, Identifier, MessagingError, RequestStatus};
use tutorlink_store::{DocumentStore, Fields, LiveQuery, Query, Record, RecordId, Value};

use crate::handle::Unsubscribe;
use crate::messenger::{read_failed, write_failed, Messenger};
use crate::models::{decode_all, SupervisionRequest};
use crate::notify::{NotificationCue, NotificationTrigger};

/// A supervisor's answer to a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn status(self) -> RequestStatus {
        match self {
            Decision::Approve => RequestStatus::Approved,
            Decision::Reject => RequestStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Inbox,
    Outbox,
}

impl Side {
    fn owner_field(self) -> &'static str {
        match self {
            Side::Inbox => f::SUPERVISOR_ID,
            Side::Outbox => f::STUDENT_ID,
        }
    }

    fn query(self, owner: &Identifier) -> Query {
        Query::collection(REQUESTS_COLLECTION)
            .where_eq(self.owner_field(), owner)
            .order_by(f::CREATED_AT)
    }
}

/// One emission of a [`RequestFeed`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub requests: Vec<SupervisionRequest>,
    pub notified: bool,
    pub initial: bool,
}

/// Live list of the requests addressed to a supervisor (inbox) or sent by a
/// student (outbox), oldest first.
pub struct RequestFeed {
    owner: Identifier,
    live: LiveQuery,
    /// Only inboxes announce new arrivals.
    trigger: Option<NotificationTrigger>,
    seen: Option<HashSet<RecordId>>,
    cancelled: Arc<AtomicBool>,
    done: bool,
}

impl RequestFeed {
    fn absorb(&mut self, records: Vec<Record>) -> RequestSnapshot {
        let requests = decode_all(&records, SupervisionRequest::from_record);
        let ids: HashSet<RecordId> = requests.iter().map(|r| r.id.clone()).collect();

        let initial = self.seen.is_none();
        let arrived = self
            .seen
            .as_ref()
            .is_some_and(|prev| ids.iter().any(|id| !prev.contains(id)));
        self.seen = Some(ids);

        let notified = match self.trigger.as_mut() {
            Some(trigger) => trigger.on_emission(&self.owner, arrived),
            None => false,
        };
        debug!(
            owner = %self.owner,
            requests = requests.len(),
            arrived,
            notified,
            "request list emission"
        );

        RequestSnapshot {
            requests,
            notified,
            initial,
        }
    }
}

impl Stream for RequestFeed {
    type Item = Result<RequestSnapshot, MessagingError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done || this.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }

        let emission = ready!(this.live.poll_next_unpin(cx));
        if this.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }

        match emission {
            Some(Ok(records)) => Poll::Ready(Some(Ok(this.absorb(records)))),
            Some(Err(e)) => {
                this.done = true;
                warn!(owner = %this.owner, error = %e, "request list unavailable");
                Poll::Ready(Some(Err(MessagingError::InboxUnavailable {
                    owner: this.owner.clone(),
                    reason: e.to_string(),
                })))
            }
            None => {
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<S: DocumentStore> Messenger<S> {
    /// File a new pending request from `student` to `supervisor`.
    pub async fn submit_request(
        &self,
        student: &Identifier,
        supervisor: &Identifier,
        note: &str,
    ) -> Result<RecordId, MessagingError> {
        if student == supervisor {
            return Err(MessagingError::InvalidIdentifier {
                value: supervisor.to_string(),
                reason: "cannot request supervision from yourself",
            });
        }

        let id = self
            .store
            .add_record(
                REQUESTS_COLLECTION,
                SupervisionRequest::new_fields(student, supervisor, note.trim()),
            )
            .await
            .map_err(write_failed("submit_request"))?;

        info!(student = %student, supervisor = %supervisor, id = %id, "supervision requested");
        Ok(id)
    }

    /// Answer a pending request addressed to `supervisor`.
    ///
    /// The status only changes if it still holds the value read here, so of
    /// two concurrent answers exactly one wins and the other gets
    /// `AlreadyAnswered`. The status update and the responses log entry are
    /// two separate writes; if the second fails the decision still stands.
    pub async fn respond(
        &self,
        request_id: &RecordId,
        supervisor: &Identifier,
        decision: Decision,
        comment: Option<&str>,
    ) -> Result<SupervisionRequest, MessagingError> {
        let record = self.load_request(request_id).await?;
        let request = SupervisionRequest::from_record(&record)?;

        if &request.supervisor_id != supervisor {
            return Err(MessagingError::NotAddressee);
        }
        if request.status != RequestStatus::Pending {
            return Err(MessagingError::AlreadyAnswered {
                status: request.status,
            });
        }

        let status = decision.status();
        let comment = comment.map(str::trim).filter(|c| !c.is_empty());
        let comment_value = comment.map_or(Value::Null, Value::from);

        let seen = record.get(f::STATUS).cloned().unwrap_or(Value::Null);
        let patch = Fields::from([
            (f::STATUS.to_string(), Value::from(status.as_str())),
            (f::COMMENT.to_string(), comment_value.clone()),
        ]);
        let applied = self
            .store
            .update_record_if(REQUESTS_COLLECTION, request_id, f::STATUS, &seen, patch)
            .await
            .map_err(write_failed("respond"))?;
        if !applied {
            let now = SupervisionRequest::from_record(&self.load_request(request_id).await?)?;
            debug!(request = %request_id, status = %now.status, "request answered concurrently");
            return Err(MessagingError::AlreadyAnswered { status: now.status });
        }

        let audit = Fields::from([
            (f::REQUEST_ID.to_string(), Value::from(request_id)),
            (f::STUDENT_ID.to_string(), Value::from(&request.student_id)),
            (f::SUPERVISOR_ID.to_string(), Value::from(supervisor)),
            (f::STATUS.to_string(), Value::from(status.as_str())),
            (f::COMMENT.to_string(), comment_value),
            (f::CREATED_AT.to_string(), Value::ServerTimestamp),
        ]);
        self.store
            .add_record(RESPONSES_COLLECTION, audit)
            .await
            .map_err(write_failed("respond"))?;

        info!(request = %request_id, supervisor = %supervisor, %status, "request answered");
        Ok(SupervisionRequest {
            status,
            supervisor_comment: comment.map(str::to_string),
            ..request
        })
    }

    /// Status of the most recent request from `student` to `supervisor`,
    /// for display. Whether the pair may talk is decided by
    /// [`open_conversation`](Self::open_conversation).
    pub async fn relationship(
        &self,
        student: &Identifier,
        supervisor: &Identifier,
    ) -> Result<Option<RequestStatus>, MessagingError> {
        Ok(self
            .requests_between(student, supervisor, "relationship")
            .await?
            .last()
            .map(|r| r.status))
    }

    /// Resolve the conversation between `me` and `other`, provided some
    /// request between them, in either direction, was approved. Later
    /// requests of the pair do not revoke an approval.
    pub async fn open_conversation(
        &self,
        me: &Identifier,
        other: &Identifier,
    ) -> Result<ConversationKey, MessagingError> {
        for (student, supervisor) in [(me, other), (other, me)] {
            let approved = self
                .requests_between(student, supervisor, "open_conversation")
                .await?
                .iter()
                .any(|r| r.status == RequestStatus::Approved);
            if approved {
                return Ok(ConversationKey::between(me, other));
            }
        }
        Err(MessagingError::NotApproved {
            a: me.clone(),
            b: other.clone(),
        })
    }

    /// Live list of requests addressed to `supervisor`. The cue plays when
    /// an emission contains a request that was not in the previous one.
    pub async fn watch_inbox(
        &self,
        supervisor: &Identifier,
        cue: Arc<dyn NotificationCue>,
    ) -> Result<(RequestFeed, Unsubscribe), MessagingError> {
        self.watch_requests(Side::Inbox, supervisor, Some(NotificationTrigger::new(cue)))
            .await
    }

    /// Live list of requests sent by `student`.
    pub async fn watch_outbox(
        &self,
        student: &Identifier,
    ) -> Result<(RequestFeed, Unsubscribe), MessagingError> {
        self.watch_requests(Side::Outbox, student, None).await
    }

    /// Delete every request addressed to `supervisor`.
    pub async fn clear_inbox(&self, supervisor: &Identifier) -> Result<usize, MessagingError> {
        self.clear_requests(Side::Inbox, supervisor).await
    }

    /// Delete every request sent by `student`.
    pub async fn clear_outbox(&self, student: &Identifier) -> Result<usize, MessagingError> {
        self.clear_requests(Side::Outbox, student).await
    }

    async fn load_request(&self, id: &RecordId) -> Result<Record, MessagingError> {
        self.store
            .get_record(REQUESTS_COLLECTION, id)
            .await
            .map_err(read_failed("respond"))?
            .ok_or_else(|| MessagingError::RequestNotFound(id.to_string()))
    }

    /// Every request from `student` to `supervisor`, oldest first.
    async fn requests_between(
        &self,
        student: &Identifier,
        supervisor: &Identifier,
        operation: &'static str,
    ) -> Result<Vec<SupervisionRequest>, MessagingError> {
        let query = Query::collection(REQUESTS_COLLECTION)
            .where_eq(f::STUDENT_ID, student)
            .where_eq(f::SUPERVISOR_ID, supervisor)
            .order_by(f::CREATED_AT);
        let records = self
            .store
            .fetch(&query)
            .await
            .map_err(read_failed(operation))?;
        Ok(decode_all(&records, SupervisionRequest::from_record))
    }

    async fn watch_requests(
        &self,
        side: Side,
        owner: &Identifier,
        trigger: Option<NotificationTrigger>,
    ) -> Result<(RequestFeed, Unsubscribe), MessagingError> {
        let live = self.store.watch(side.query(owner)).await.map_err(|e| {
            MessagingError::InboxUnavailable {
                owner: owner.clone(),
                reason: e.to_string(),
            }
        })?;
        let handle = Unsubscribe::new(vec![live.token()]);
        debug!(owner = %owner, ?side, "request list subscribed");

        let feed = RequestFeed {
            owner: owner.clone(),
            live,
            trigger,
            seen: None,
            cancelled: handle.flag(),
            done: false,
        };
        Ok((feed, handle))
    }

    async fn clear_requests(
        &self,
        side: Side,
        owner: &Identifier,
    ) -> Result<usize, MessagingError> {
        let ids: Vec<RecordId> = self
            .store
            .fetch(&side.query(owner))
            .await
            .map_err(read_failed("clear_requests"))?
            .into_iter()
            .map(|r| r.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let removed = self
            .store
            .batch_delete(REQUESTS_COLLECTION, &ids)
            .await
            .map_err(write_failed("clear_requests"))?;
        info!(owner = %owner, ?side, removed, "requests cleared");
        Ok(removed)
    }
}
