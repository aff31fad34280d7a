//! Unread Aggregator.
//!
//! One live query per counterparty, merged into a single stream. Every
//! update of any counterparty yields the whole mapping, zero counts
//! included. A broken counterparty is reported once and keeps its last
//! count; the others carry on.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, SelectAll};
use futures::{ready, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use tutorlink_shared::constants::{fields as f, MESSAGES_COLLECTION};
use tutorlink_shared::{ConversationKey, Identifier, MessagingError};
use tutorlink_store::{DocumentStore, Emission, Query};

use crate::handle::Unsubscribe;
use crate::messenger::Messenger;

/// Unread messages per counterparty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UnreadCounts(BTreeMap<Identifier, usize>);

impl UnreadCounts {
    /// Count for `counterparty`, 0 if it is not tracked.
    pub fn get(&self, counterparty: &Identifier) -> usize {
        self.0.get(counterparty).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identifier, usize)> {
        self.0.iter().map(|(who, n)| (who, *n))
    }
}

type Tagged = BoxStream<'static, (Identifier, Emission)>;

/// Merged unread counts of one user across a set of counterparties.
pub struct UnreadTracker {
    me: Identifier,
    streams: SelectAll<Tagged>,
    counts: UnreadCounts,
    failed: BTreeSet<Identifier>,
    /// Failures found while setting up, reported before any update.
    pending: VecDeque<MessagingError>,
    cancelled: Arc<AtomicBool>,
}

impl UnreadTracker {
    /// Latest mapping, as last emitted.
    pub fn counts(&self) -> &UnreadCounts {
        &self.counts
    }

    /// Counterparties whose tracking broke.
    pub fn failed(&self) -> &BTreeSet<Identifier> {
        &self.failed
    }

    fn fail(&mut self, counterparty: Identifier, reason: String) -> MessagingError {
        warn!(me = %self.me, counterparty = %counterparty, %reason, "unread tracking failed");
        self.failed.insert(counterparty.clone());
        MessagingError::PartialSubscriptionFailure {
            counterparty,
            reason,
        }
    }
}

impl Stream for UnreadTracker {
    type Item = Result<UnreadCounts, MessagingError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }
        if let Some(err) = this.pending.pop_front() {
            return Poll::Ready(Some(Err(err)));
        }
        // SelectAll reports exhaustion as soon as it is empty.
        if this.streams.is_empty() {
            return Poll::Ready(None);
        }

        let next = ready!(this.streams.poll_next_unpin(cx));
        if this.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }

        match next {
            Some((who, Ok(records))) => {
                this.counts.0.insert(who.clone(), records.len());
                debug!(
                    me = %this.me,
                    counterparty = %who,
                    unread = records.len(),
                    total = this.counts.total(),
                    "unread count updated"
                );
                Poll::Ready(Some(Ok(this.counts.clone())))
            }
            Some((who, Err(e))) => Poll::Ready(Some(Err(this.fail(who, e.to_string())))),
            None => Poll::Ready(None),
        }
    }
}

impl<S: DocumentStore> Messenger<S> {
    /// Track how many unread messages each counterparty has sent to `me`.
    ///
    /// Every counterparty starts at 0. A counterparty whose live query cannot
    /// be established is reported through the stream as
    /// [`MessagingError::PartialSubscriptionFailure`] instead of failing the
    /// whole call.
    pub async fn track_unread<I>(
        &self,
        me: &Identifier,
        counterparties: I,
    ) -> Result<(UnreadTracker, Unsubscribe), MessagingError>
    where
        I: IntoIterator<Item = Identifier>,
    {
        let counterparties: BTreeSet<Identifier> = counterparties.into_iter().collect();
        if counterparties.contains(me) {
            return Err(MessagingError::InvalidIdentifier {
                value: me.to_string(),
                reason: "cannot track unread messages from yourself",
            });
        }

        let mut streams = SelectAll::new();
        let mut tokens = Vec::with_capacity(counterparties.len());
        let mut counts = UnreadCounts::default();
        let mut pending = VecDeque::new();
        let mut failed = BTreeSet::new();

        for who in counterparties {
            counts.0.insert(who.clone(), 0);
            let query = Query::collection(MESSAGES_COLLECTION)
                .where_eq(f::CONVERSATION_KEY, &ConversationKey::between(me, &who))
                .where_eq(f::SENDER_ID, &who)
                .where_eq(f::READ, false);

            match self.store.watch(query).await {
                Ok(live) => {
                    tokens.push(live.token());
                    let tag = who.clone();
                    let tagged: Tagged = live.map(move |e| (tag.clone(), e)).boxed();
                    streams.push(tagged);
                }
                Err(e) => {
                    warn!(me = %me, counterparty = %who, error = %e, "could not track unread");
                    failed.insert(who.clone());
                    pending.push_back(MessagingError::PartialSubscriptionFailure {
                        counterparty: who,
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!(me = %me, tracked = tokens.len(), failed = failed.len(), "unread tracking started");
        let handle = Unsubscribe::new(tokens);
        let tracker = UnreadTracker {
            me: me.clone(),
            streams,
            counts,
            failed,
            pending,
            cancelled: handle.flag(),
        };
        Ok((tracker, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tutorlink_store::{fields, MemoryStore, Value};

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, Messenger<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), Messenger::new(store))
    }

    /// Pull `n` mappings and return the last one.
    async fn settle(tracker: &mut UnreadTracker, n: usize) -> UnreadCounts {
        let mut last = None;
        for _ in 0..n {
            last = Some(tracker.next().await.unwrap().unwrap());
        }
        last.unwrap()
    }

    #[tokio::test]
    async fn hello_shows_one_unread_for_sender() {
        let (_store, messenger) = setup();
        let (s, p) = (id("s@uni.edu"), id("p@uni.edu"));

        let (mut tracker, _handle) = messenger.track_unread(&p, [s.clone()]).await.unwrap();
        assert_eq!(settle(&mut tracker, 1).await.get(&s), 0);

        messenger.send_message(&s, &p, "Hello").await.unwrap();
        let counts = settle(&mut tracker, 1).await;
        assert_eq!(counts.get(&s), 1);
        assert_eq!(counts.len(), 1);
    }

    #[tokio::test]
    async fn mapping_always_has_every_counterparty() {
        let (_store, messenger) = setup();
        let me = id("p@uni.edu");
        let (a, b, c) = (id("a@uni.edu"), id("b@uni.edu"), id("c@uni.edu"));

        let (mut tracker, _handle) = messenger
            .track_unread(&me, [a.clone(), b.clone(), c.clone()])
            .await
            .unwrap();
        let initial = settle(&mut tracker, 3).await;
        assert_eq!(initial.len(), 3);
        assert_eq!(initial.total(), 0);

        messenger.send_message(&a, &me, "1").await.unwrap();
        messenger.send_message(&a, &me, "2").await.unwrap();
        messenger.send_message(&c, &me, "3").await.unwrap();
        // Own messages never count.
        messenger.send_message(&me, &b, "reply").await.unwrap();

        let counts = settle(&mut tracker, 3).await;
        assert_eq!(counts.len(), 3);
        assert_eq!(counts.get(&a), 2);
        assert_eq!(counts.get(&b), 0);
        assert_eq!(counts.get(&c), 1);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn mark_read_lowers_only_that_count() {
        let (_store, messenger) = setup();
        let me = id("p@uni.edu");
        let (a, b) = (id("a@uni.edu"), id("b@uni.edu"));
        messenger.send_message(&a, &me, "x").await.unwrap();
        messenger.send_message(&b, &me, "y").await.unwrap();

        let (mut tracker, _handle) = messenger
            .track_unread(&me, [a.clone(), b.clone()])
            .await
            .unwrap();
        let before = settle(&mut tracker, 2).await;
        assert_eq!((before.get(&a), before.get(&b)), (1, 1));

        let key = ConversationKey::between(&me, &a);
        assert_eq!(messenger.mark_read(&key, &me, Utc::now()).await.unwrap(), 1);

        let after = settle(&mut tracker, 1).await;
        assert_eq!((after.get(&a), after.get(&b)), (0, 1));
    }

    #[tokio::test]
    async fn undecodable_unread_message_can_still_be_marked_read() {
        let (store, messenger) = setup();
        let me = id("p@uni.edu");
        let a = id("a@uni.edu");
        let key = ConversationKey::between(&me, &a);

        let mut broken = fields([
            (f::CONVERSATION_KEY, key.as_str()),
            (f::SENDER_ID, a.as_str()),
            (f::RECEIVER_ID, "bad|id"),
            (f::TEXT, "garbled"),
        ]);
        broken.insert(f::READ.to_string(), Value::Bool(false));
        broken.insert(f::CREATED_AT.to_string(), Value::ServerTimestamp);
        store.add_record(MESSAGES_COLLECTION, broken).await.unwrap();

        let (mut tracker, _handle) = messenger.track_unread(&me, [a.clone()]).await.unwrap();
        assert_eq!(settle(&mut tracker, 1).await.get(&a), 1);

        assert_eq!(messenger.mark_read(&key, &me, Utc::now()).await.unwrap(), 1);
        assert_eq!(settle(&mut tracker, 1).await.get(&a), 0);
    }

    #[tokio::test]
    async fn one_broken_counterparty_does_not_stop_the_others() {
        let (store, messenger) = setup();
        let me = id("p@uni.edu");
        let (a, b) = (id("a@uni.edu"), id("b@uni.edu"));

        let (mut tracker, _handle) = messenger
            .track_unread(&me, [a.clone(), b.clone()])
            .await
            .unwrap();
        settle(&mut tracker, 2).await;

        messenger.send_message(&b, &me, "before").await.unwrap();
        assert_eq!(settle(&mut tracker, 1).await.get(&b), 1);

        assert_eq!(store.break_watches(f::SENDER_ID, &b, "network lost"), 1);
        match tracker.next().await {
            Some(Err(MessagingError::PartialSubscriptionFailure { counterparty, .. })) => {
                assert_eq!(counterparty, b);
            }
            other => panic!("expected PartialSubscriptionFailure, got {other:?}"),
        }
        assert!(tracker.failed().contains(&b));

        messenger.send_message(&a, &me, "still here").await.unwrap();
        let counts = settle(&mut tracker, 1).await;
        assert_eq!(counts.get(&a), 1);
        // Last known value is kept.
        assert_eq!(counts.get(&b), 1);
        assert_eq!(store.active_watches(), 1);
    }

    #[tokio::test]
    async fn single_unsubscribe_tears_everything_down() {
        let (store, messenger) = setup();
        let me = id("p@uni.edu");
        let (mut tracker, handle) = messenger
            .track_unread(&me, [id("a@uni.edu"), id("b@uni.edu"), id("c@uni.edu")])
            .await
            .unwrap();
        assert_eq!(store.active_watches(), 3);

        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        assert_eq!(store.active_watches(), 0);
        assert!(tracker.next().await.is_none());
    }

    #[tokio::test]
    async fn tracking_yourself_is_rejected() {
        let (_store, messenger) = setup();
        let me = id("p@uni.edu");
        let err = messenger.track_unread(&me, [me.clone()]).await;
        assert!(matches!(err, Err(MessagingError::InvalidIdentifier { .. })));
    }
}
