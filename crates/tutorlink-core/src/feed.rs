//! Message Feed Subscriber.
//!
//! Each emission carries the full ordered message list of one conversation,
//! never a delta. The feed keeps the previous count as a baseline and tells
//! its [`NotificationTrigger`] when an emission grew the list with a message
//! from the other participant.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{ready, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use tutorlink_shared::constants::{fields as f, MESSAGES_COLLECTION};
use tutorlink_shared::{ConversationKey, Identifier, MessagingError};
use tutorlink_store::{DocumentStore, LiveQuery, Query, Record};

use crate::handle::Unsubscribe;
use crate::messenger::Messenger;
use crate::models::{decode_all, Message};
use crate::notify::{NotificationCue, NotificationTrigger};

/// One emission of a [`MessageFeed`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSnapshot {
    /// Every message of the conversation, oldest first.
    pub messages: Vec<Message>,
    /// Whether this emission fired the notification cue.
    pub notified: bool,
    /// Whether this is the first emission after subscribing.
    pub initial: bool,
}

/// Live, ordered view of one conversation.
///
/// Ends after yielding [`MessagingError::FeedUnavailable`]; there is no
/// automatic resubscription.
pub struct MessageFeed {
    key: ConversationKey,
    me: Identifier,
    live: LiveQuery,
    trigger: NotificationTrigger,
    /// Message count of the previous emission.
    baseline: Option<usize>,
    cancelled: Arc<AtomicBool>,
    done: bool,
}

impl MessageFeed {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn trigger(&self) -> &NotificationTrigger {
        &self.trigger
    }

    fn absorb(&mut self, records: Vec<Record>) -> FeedSnapshot {
        let messages = decode_all(&records, Message::from_record);
        let initial = self.baseline.is_none();

        let new_incoming = self.baseline.is_some_and(|prev| messages.len() > prev)
            && messages.last().is_some_and(|m| !m.is_from(&self.me));
        self.baseline = Some(messages.len());

        let notified = self.trigger.on_emission(&self.key, new_incoming);
        debug!(
            conversation = %self.key,
            messages = messages.len(),
            new_incoming,
            notified,
            "feed emission"
        );

        FeedSnapshot {
            messages,
            notified,
            initial,
        }
    }
}

impl Stream for MessageFeed {
    type Item = Result<FeedSnapshot, MessagingError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done || this.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }

        let emission = ready!(this.live.poll_next_unpin(cx));
        // Unsubscribed while we were waiting.
        if this.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }

        match emission {
            Some(Ok(records)) => Poll::Ready(Some(Ok(this.absorb(records)))),
            Some(Err(e)) => {
                this.done = true;
                warn!(conversation = %this.key, error = %e, "message feed unavailable");
                Poll::Ready(Some(Err(MessagingError::FeedUnavailable {
                    key: this.key.clone(),
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
    /// Subscribe to the messages of `key` as seen by `me`.
    ///
    /// `me` must be one of the two participants. The returned handle stops
    /// the feed; dropping the feed has the same effect.
    pub async fn subscribe_feed(
        &self,
        key: &ConversationKey,
        me: &Identifier,
        cue: Arc<dyn NotificationCue>,
    ) -> Result<(MessageFeed, Unsubscribe), MessagingError> {
        if key.counterparty_of(me).is_none() {
            return Err(MessagingError::InvalidIdentifier {
                value: me.to_string(),
                reason: "not a participant of the conversation",
            });
        }

        let query = Query::collection(MESSAGES_COLLECTION)
            .where_eq(f::CONVERSATION_KEY, key)
            .order_by(f::CREATED_AT);
        let live = self
            .store
            .watch(query)
            .await
            .map_err(|e| MessagingError::FeedUnavailable {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        let handle = Unsubscribe::new(vec![live.token()]);
        debug!(conversation = %key, me = %me, "feed subscribed");

        let feed = MessageFeed {
            key: key.clone(),
            me: me.clone(),
            live,
            trigger: NotificationTrigger::new(cue),
            baseline: None,
            cancelled: handle.flag(),
            done: false,
        };
        Ok((feed, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::tests::CountingCue;
    use crate::notify::TriggerState;
    use tutorlink_store::MemoryStore;

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        messenger: Messenger<MemoryStore>,
        cue: Arc<CountingCue>,
        student: Identifier,
        supervisor: Identifier,
        key: ConversationKey,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let student = id("s@uni.edu");
        let supervisor = id("p@uni.edu");
        Fixture {
            messenger: Messenger::new(store.clone()),
            store,
            cue: Arc::new(CountingCue::default()),
            key: ConversationKey::between(&student, &supervisor),
            student,
            supervisor,
        }
    }

    async fn next(feed: &mut MessageFeed) -> FeedSnapshot {
        feed.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn notifies_once_for_incoming_growth_only() {
        let fx = fixture();
        let (s, p) = (&fx.student, &fx.supervisor);
        fx.messenger.send_message(p, s, "m1").await.unwrap();

        let (mut feed, _handle) = fx
            .messenger
            .subscribe_feed(&fx.key, s, fx.cue.clone())
            .await
            .unwrap();

        let first = next(&mut feed).await;
        assert!(first.initial);
        assert!(!first.notified);
        assert_eq!(first.messages.len(), 1);
        assert_eq!(feed.trigger().state(), TriggerState::Active);

        fx.messenger.send_message(p, s, "m2").await.unwrap();
        let second = next(&mut feed).await;
        assert!(second.notified);
        assert_eq!(second.messages.len(), 2);

        fx.messenger.send_message(s, p, "m3").await.unwrap();
        let third = next(&mut feed).await;
        assert!(!third.notified);
        let texts: Vec<&str> = third.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["m1", "m2", "m3"]);

        assert_eq!(fx.cue.count(), 1);
        assert_eq!(feed.trigger().played(), 1);
    }

    #[tokio::test]
    async fn busy_conversation_opens_quietly() {
        let fx = fixture();
        for text in ["a", "b", "c"] {
            fx.messenger
                .send_message(&fx.supervisor, &fx.student, text)
                .await
                .unwrap();
        }
        let (mut feed, _handle) = fx
            .messenger
            .subscribe_feed(&fx.key, &fx.student, fx.cue.clone())
            .await
            .unwrap();
        assert_eq!(next(&mut feed).await.messages.len(), 3);
        assert_eq!(fx.cue.count(), 0);
    }

    #[tokio::test]
    async fn hello_scenario_yields_single_unread_record() {
        let fx = fixture();
        fx.messenger
            .send_message(&fx.student, &fx.supervisor, "Hello")
            .await
            .unwrap();

        let (mut feed, _handle) = fx
            .messenger
            .subscribe_feed(&fx.key, &fx.supervisor, fx.cue.clone())
            .await
            .unwrap();
        let snap = next(&mut feed).await;
        assert_eq!(snap.messages.len(), 1);
        let m = &snap.messages[0];
        assert_eq!(m.sender_id, fx.student);
        assert_eq!(m.text, "Hello");
        assert!(!m.read);
    }

    #[tokio::test]
    async fn broken_subscription_reports_feed_unavailable_then_ends() {
        let fx = fixture();
        let (mut feed, _handle) = fx
            .messenger
            .subscribe_feed(&fx.key, &fx.student, fx.cue.clone())
            .await
            .unwrap();
        next(&mut feed).await;

        fx.store
            .break_watches(f::CONVERSATION_KEY, &fx.key, "permission denied");
        match feed.next().await {
            Some(Err(MessagingError::FeedUnavailable { key, reason })) => {
                assert_eq!(key, fx.key);
                assert!(reason.contains("permission denied"));
            }
            other => panic!("expected FeedUnavailable, got {other:?}"),
        }
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_emissions() {
        let fx = fixture();
        let (mut feed, handle) = fx
            .messenger
            .subscribe_feed(&fx.key, &fx.student, fx.cue.clone())
            .await
            .unwrap();
        next(&mut feed).await;
        fx.messenger
            .send_message(&fx.supervisor, &fx.student, "queued")
            .await
            .unwrap();

        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        assert!(handle.is_cancelled());
        assert_eq!(fx.store.active_watches(), 0);

        // The queued emission is not delivered.
        assert!(feed.next().await.is_none());
        assert_eq!(fx.cue.count(), 0);
    }

    #[tokio::test]
    async fn bulk_clear_is_all_or_nothing() {
        let fx = fixture();
        let (s, p) = (&fx.student, &fx.supervisor);
        fx.messenger.send_message(s, p, "one").await.unwrap();
        fx.messenger.send_message(p, s, "two").await.unwrap();

        let (mut feed, _handle) = fx
            .messenger
            .subscribe_feed(&fx.key, s, fx.cue.clone())
            .await
            .unwrap();
        assert_eq!(next(&mut feed).await.messages.len(), 2);

        fx.store.fail_next_writes(1);
        assert!(fx.messenger.clear_conversation(&fx.key).await.is_err());
        assert_eq!(fx.store.count(MESSAGES_COLLECTION), 2);

        assert_eq!(fx.messenger.clear_conversation(&fx.key).await.unwrap(), 2);
        let cleared = next(&mut feed).await;
        assert!(cleared.messages.is_empty());
        assert!(!cleared.notified);
    }

    #[tokio::test]
    async fn sqlite_feed_sees_writes_from_another_handle_after_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.db");
        let (s, p) = (id("s@uni.edu"), id("p@uni.edu"));
        let key = ConversationKey::between(&s, &p);
        let cue = Arc::new(CountingCue::default());

        let reader = Arc::new(tutorlink_store::SqliteStore::open_at(&path).unwrap());
        let writer = Messenger::new(Arc::new(
            tutorlink_store::SqliteStore::open_at(&path).unwrap(),
        ));

        let (mut feed, _handle) = Messenger::new(reader.clone())
            .subscribe_feed(&key, &s, cue.clone())
            .await
            .unwrap();
        assert!(next(&mut feed).await.messages.is_empty());

        writer.send_message(&p, &s, "from elsewhere").await.unwrap();
        reader.refresh();

        let snap = next(&mut feed).await;
        assert_eq!(snap.messages.len(), 1);
        assert_eq!(snap.messages[0].text, "from elsewhere");
        assert!(snap.notified);
        assert_eq!(cue.count(), 1);
    }

    #[tokio::test]
    async fn outsider_cannot_subscribe() {
        let fx = fixture();
        let err = fx
            .messenger
            .subscribe_feed(&fx.key, &id("x@uni.edu"), fx.cue.clone())
            .await;
        assert!(matches!(err, Err(MessagingError::InvalidIdentifier { .. })));
    }
}
