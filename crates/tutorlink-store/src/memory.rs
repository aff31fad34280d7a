//! In-process document store.
//!
//! Holds every collection in memory and serves live queries through a
//! [`WatchHub`]. Besides embedding, it is the store used to exercise the
//! messaging core: writes can be made to fail and live queries can be
//! broken on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::live::{LiveQuery, WatchHub};
use crate::models::{resolve_server_values, Fields, Query, Record, RecordId, Value};
use crate::store::{CommitClock, DocumentStore};

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<RecordId, Fields>>,
    clock: CommitClock,
    /// Number of upcoming writes that must fail.
    failing_writes: usize,
}

impl MemoryState {
    fn run_query(&self, query: &Query) -> Vec<Record> {
        let Some(records) = self.collections.get(&query.collection) else {
            return Vec::new();
        };
        query.apply(records.iter().map(|(id, fields)| Record {
            id: id.clone(),
            fields: fields.clone(),
        }))
    }

    /// Consume one injected failure, if any is pending.
    fn take_write_failure(&mut self, operation: &str) -> Result<()> {
        if self.failing_writes == 0 {
            return Ok(());
        }
        self.failing_writes -= 1;
        warn!(operation, "injected write failure");
        Err(StoreError::Rejected(format!("injected failure in {operation}")))
    }
}

/// Document store kept entirely in memory.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    hub: Arc<WatchHub>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            hub: WatchHub::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` writes fail with [`StoreError::Rejected`] without
    /// committing anything.
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().failing_writes = n;
    }

    /// Break every live query that filters `field == value`. Returns how
    /// many queries were broken.
    pub fn break_watches(&self, field: &str, value: impl Into<Value>, reason: &str) -> usize {
        let value = value.into();
        self.hub
            .fail_where(|q| q.filter_value(field) == Some(&value), reason)
    }

    /// Number of registered live queries.
    pub fn active_watches(&self) -> usize {
        self.hub.active()
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    fn publish(&self, state: &MemoryState, collection: &str) {
        self.hub.publish(collection, |q| Ok(state.run_query(q)));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    async fn watch(&self, query: Query) -> Result<LiveQuery> {
        let state = self.lock();
        let initial = state.run_query(&query);
        Ok(self.hub.register(query, initial))
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Record>> {
        Ok(self.lock().run_query(query))
    }

    async fn get_record(&self, collection: &str, id: &RecordId) -> Result<Option<Record>> {
        let state = self.lock();
        Ok(state
            .collections
            .get(collection)
            .and_then(|records| records.get(id))
            .map(|fields| Record {
                id: id.clone(),
                fields: fields.clone(),
            }))
    }

    async fn add_record(&self, collection: &str, mut fields: Fields) -> Result<RecordId> {
        let mut state = self.lock();
        state.take_write_failure("add_record")?;

        let now = state.clock.next();
        resolve_server_values(&mut fields, now);

        let id = RecordId::generate();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields);

        debug!(collection, id = %id, "record added");
        self.publish(&state, collection);
        Ok(id)
    }

    async fn update_record(&self, collection: &str, id: &RecordId, patch: Fields) -> Result<()> {
        self.batch_update(collection, vec![(id.clone(), patch)])
            .await
            .map(|_| ())
    }

    async fn update_record_if(
        &self,
        collection: &str,
        id: &RecordId,
        field: &str,
        expected: &Value,
        mut patch: Fields,
    ) -> Result<bool> {
        let mut state = self.lock();
        let holds = match state.collections.get(collection).and_then(|c| c.get(id)) {
            Some(current) => current.get(field) == Some(expected),
            None => {
                return Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })
            }
        };
        if !holds {
            debug!(collection, id = %id, field, "guarded update skipped");
            return Ok(false);
        }
        state.take_write_failure("update_record_if")?;

        let now = state.clock.next();
        resolve_server_values(&mut patch, now);
        if let Some(existing) = state
            .collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
        {
            existing.extend(patch);
        }

        debug!(collection, id = %id, field, "guarded update committed");
        self.publish(&state, collection);
        Ok(true)
    }

    async fn batch_update(
        &self,
        collection: &str,
        updates: Vec<(RecordId, Fields)>,
    ) -> Result<usize> {
        let mut state = self.lock();
        let now = state.clock.next();

        // Stage on a copy so a failure leaves the collection untouched.
        let mut staged = state
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default();
        for (id, mut patch) in updates.iter().cloned() {
            let Some(existing) = staged.get_mut(&id) else {
                return Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            };
            resolve_server_values(&mut patch, now);
            existing.extend(patch);
        }
        state.take_write_failure("batch_update")?;

        state.collections.insert(collection.to_string(), staged);
        debug!(collection, updated = updates.len(), "batch update committed");
        self.publish(&state, collection);
        Ok(updates.len())
    }

    async fn batch_delete(&self, collection: &str, ids: &[RecordId]) -> Result<usize> {
        let mut state = self.lock();

        let mut staged = state
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default();
        let removed = ids.iter().filter_map(|id| staged.remove(id)).count();
        state.take_write_failure("batch_delete")?;

        state.collections.insert(collection.to_string(), staged);
        debug!(collection, removed, "batch delete committed");
        self.publish(&state, collection);
        Ok(removed)
    }
}
