//! The document store contract the messaging core is written against.

use std::future::Future;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::live::LiveQuery;
use crate::models::{Fields, Query, Record, RecordId, Value};

/// Hosted-document-database operations consumed by the messaging core.
///
/// Every call may suspend. Writes are visible to live queries as soon as
/// the returned future completes.
pub trait DocumentStore: Send + Sync + 'static {
    /// Open a live query. The first emission is the current result set;
    /// later emissions come whenever that result set changes.
    fn watch(&self, query: Query) -> impl Future<Output = Result<LiveQuery>> + Send;

    /// One-shot read.
    fn fetch(&self, query: &Query) -> impl Future<Output = Result<Vec<Record>>> + Send;

    /// Point read by id; `None` if the record does not exist.
    fn get_record(
        &self,
        collection: &str,
        id: &RecordId,
    ) -> impl Future<Output = Result<Option<Record>>> + Send;

    /// Insert a record and return its store-assigned id.
    /// [`Value::ServerTimestamp`](crate::Value::ServerTimestamp) fields are
    /// replaced with the commit time.
    fn add_record(
        &self,
        collection: &str,
        fields: Fields,
    ) -> impl Future<Output = Result<RecordId>> + Send;

    /// Merge `patch` into an existing record.
    fn update_record(
        &self,
        collection: &str,
        id: &RecordId,
        patch: Fields,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Merge `patch` only if `field` still holds `expected`, checked and
    /// written under one lock. Returns `false` when the guard did not hold
    /// and nothing was written.
    fn update_record_if(
        &self,
        collection: &str,
        id: &RecordId,
        field: &str,
        expected: &Value,
        patch: Fields,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Merge several patches atomically. If any target is missing nothing
    /// is written.
    fn batch_update(
        &self,
        collection: &str,
        updates: Vec<(RecordId, Fields)>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Delete records atomically; missing ids are ignored. Returns how many
    /// records were removed.
    fn batch_delete(
        &self,
        collection: &str,
        ids: &[RecordId],
    ) -> impl Future<Output = Result<usize>> + Send;
}

/// Hands out strictly increasing commit timestamps, even when the wall
/// clock stalls or steps back.
#[derive(Debug, Default)]
pub(crate) struct CommitClock {
    last: Option<DateTime<Utc>>,
}

impl CommitClock {
    pub(crate) fn next(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(ts);
        ts
    }
}
