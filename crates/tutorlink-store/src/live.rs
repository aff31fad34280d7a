//! Live query plumbing shared by the backends.
//!
//! Every backend owns one [`WatchHub`]. Registering a query hands back a
//! [`LiveQuery`] whose first emission is the current snapshot. After each
//! committed write the backend asks the hub to re-evaluate the queries on
//! that collection; a watcher only receives a new snapshot when its result
//! set actually changed.
//!
//! Each watcher has its own unbounded channel, so emissions of one query
//! arrive in commit order and are consumed one at a time by whoever polls
//! the [`LiveQuery`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::models::{Query, Record};

/// Full, ordered result set of a query at one point in time.
pub type Snapshot = Vec<Record>;

/// One delivery on a live query.
pub type Emission = Result<Snapshot>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

struct Watcher {
    query: Query,
    tx: mpsc::UnboundedSender<Emission>,
    last: Snapshot,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    watchers: HashMap<WatchId, Watcher>,
}

/// Registry of active live queries for one backend.
#[derive(Default)]
pub struct WatchHub {
    inner: Mutex<HubInner>,
}

impl WatchHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `query` and queue `initial` as its first emission.
    pub fn register(self: &Arc<Self>, query: Query, initial: Snapshot) -> LiveQuery {
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(Ok(initial.clone()));

        let mut inner = self.lock();
        let id = WatchId(inner.next_id);
        inner.next_id += 1;

        debug!(
            watch = id.0,
            collection = %query.collection,
            initial = initial.len(),
            "live query registered"
        );

        inner.watchers.insert(
            id,
            Watcher {
                query,
                tx,
                last: initial,
            },
        );

        LiveQuery {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Re-evaluate every query on `collection` after a committed write.
    ///
    /// An evaluation error is delivered to that watcher and ends it.
    pub fn publish<F>(&self, collection: &str, mut eval: F)
    where
        F: FnMut(&Query) -> Result<Snapshot>,
    {
        let mut inner = self.lock();
        let mut dead = Vec::new();
        for (id, watcher) in inner.watchers.iter_mut() {
            if watcher.query.collection != collection {
                continue;
            }
            if !deliver(watcher, eval(&watcher.query)) {
                dead.push(*id);
            }
        }
        for id in dead {
            inner.watchers.remove(&id);
        }
    }

    /// Re-evaluate every registered query regardless of collection.
    pub fn publish_all<F>(&self, mut eval: F)
    where
        F: FnMut(&Query) -> Result<Snapshot>,
    {
        let mut inner = self.lock();
        let mut dead = Vec::new();
        for (id, watcher) in inner.watchers.iter_mut() {
            if !deliver(watcher, eval(&watcher.query)) {
                dead.push(*id);
            }
        }
        for id in dead {
            inner.watchers.remove(&id);
        }
    }

    /// Break every live query matching `pred`: each receives one
    /// [`StoreError::Unavailable`] and is then closed. Returns how many
    /// queries were broken.
    pub fn fail_where<P>(&self, pred: P, reason: &str) -> usize
    where
        P: Fn(&Query) -> bool,
    {
        let mut inner = self.lock();
        let doomed: Vec<WatchId> = inner
            .watchers
            .iter()
            .filter(|(_, w)| pred(&w.query))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            if let Some(watcher) = inner.watchers.remove(id) {
                let _ = watcher
                    .tx
                    .send(Err(StoreError::Unavailable(reason.to_string())));
            }
        }
        doomed.len()
    }

    /// Unregister a set of queries under one lock acquisition.
    pub fn cancel(&self, ids: &[WatchId]) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        for id in ids {
            if inner.watchers.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "live queries cancelled");
        }
        removed
    }

    /// Number of registered live queries.
    pub fn active(&self) -> usize {
        self.lock().watchers.len()
    }
}

/// Returns `false` when the watcher should be dropped.
fn deliver(watcher: &mut Watcher, result: Result<Snapshot>) -> bool {
    match result {
        Ok(snapshot) => {
            if snapshot == watcher.last {
                return true;
            }
            if watcher.tx.send(Ok(snapshot.clone())).is_err() {
                return false;
            }
            watcher.last = snapshot;
            true
        }
        Err(e) => {
            let _ = watcher.tx.send(Err(e));
            false
        }
    }
}

/// Stream of snapshots for one registered query.
///
/// Dropping it unregisters the query.
pub struct LiveQuery {
    id: WatchId,
    rx: mpsc::UnboundedReceiver<Emission>,
    hub: Weak<WatchHub>,
}

impl LiveQuery {
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Detached handle that can cancel this query from elsewhere.
    pub fn token(&self) -> WatchToken {
        WatchToken {
            id: self.id,
            hub: self.hub.clone(),
        }
    }

    /// Wait for the next emission. `None` once the query is cancelled or
    /// has delivered its error.
    pub async fn next_emission(&mut self) -> Option<Emission> {
        self.rx.recv().await
    }
}

impl Stream for LiveQuery {
    type Item = Emission;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.cancel(&[self.id]);
        }
    }
}

/// Cancellation handle for a [`LiveQuery`], usable after the stream has
/// been moved elsewhere.
#[derive(Clone)]
pub struct WatchToken {
    id: WatchId,
    hub: Weak<WatchHub>,
}

impl WatchToken {
    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn cancel(&self) {
        Self::cancel_all(std::slice::from_ref(self));
    }

    /// Cancel many queries; those sharing a hub go in a single step.
    pub fn cancel_all(tokens: &[WatchToken]) {
        let mut remaining: Vec<&WatchToken> = tokens.iter().collect();
        while let Some(head) = remaining.first().copied() {
            let (same, rest): (Vec<&WatchToken>, Vec<&WatchToken>) = remaining
                .into_iter()
                .partition(|t| Weak::ptr_eq(&t.hub, &head.hub));
            if let Some(hub) = head.hub.upgrade() {
                let ids: Vec<WatchId> = same.iter().map(|t| t.id).collect();
                hub.cancel(&ids);
            }
            remaining = rest;
        }
    }
}

impl std::fmt::Debug for WatchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchToken").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fields, RecordId};
    use futures::StreamExt;

    fn rec(id: &str) -> Record {
        Record {
            id: RecordId::from(id),
            fields: fields([("k", "v")]),
        }
    }

    #[tokio::test]
    async fn first_emission_is_initial_snapshot() {
        let hub = WatchHub::new();
        let mut live = hub.register(Query::collection("c"), vec![rec("a")]);
        let first = live.next().await.unwrap().unwrap();
        assert_eq!(first, vec![rec("a")]);
    }

    #[tokio::test]
    async fn unchanged_results_are_not_redelivered() {
        let hub = WatchHub::new();
        let mut live = hub.register(Query::collection("c"), vec![rec("a")]);
        live.next().await.unwrap().unwrap();

        hub.publish("c", |_| Ok(vec![rec("a")]));
        hub.publish("other", |_| Ok(vec![]));
        hub.publish("c", |_| Ok(vec![rec("a"), rec("b")]));

        let next = live.next().await.unwrap().unwrap();
        assert_eq!(next.len(), 2);
    }

    #[tokio::test]
    async fn failure_ends_the_query() {
        let hub = WatchHub::new();
        let mut live = hub.register(Query::collection("c"), vec![]);
        live.next().await.unwrap().unwrap();

        assert_eq!(hub.fail_where(|q| q.collection == "c", "offline"), 1);
        assert!(matches!(
            live.next().await,
            Some(Err(StoreError::Unavailable(_)))
        ));
        assert!(live.next().await.is_none());
        assert_eq!(hub.active(), 0);
    }

    #[tokio::test]
    async fn cancel_closes_stream_and_is_idempotent() {
        let hub = WatchHub::new();
        let mut live = hub.register(Query::collection("c"), vec![]);
        let token = live.token();
        live.next().await.unwrap().unwrap();

        token.cancel();
        token.cancel();
        assert_eq!(hub.active(), 0);
        assert!(live.next().await.is_none());
    }

    #[test]
    fn dropping_unregisters() {
        let hub = WatchHub::new();
        let live = hub.register(Query::collection("c"), vec![]);
        assert_eq!(hub.active(), 1);
        drop(live);
        assert_eq!(hub.active(), 0);
    }
}
