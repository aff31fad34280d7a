//! [`DocumentStore`] operations of [`SqliteStore`].
//!
//! Equality filters on text values run in SQL through `json_extract`, so a
//! query only decodes the rows that can match. Everything else (non-text
//! filters, ordering) is applied to the decoded records. Live queries are
//! still re-run on every write to their collection.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::database::SqliteStore;
use crate::error::{Result, StoreError};
use crate::live::LiveQuery;
use crate::models::{resolve_server_values, Fields, Query, Record, RecordId, Value};
use crate::store::DocumentStore;

impl SqliteStore {
    /// Re-evaluate every live query against the database file and deliver
    /// whatever changed since the last emission.
    pub fn refresh(&self) {
        let inner = self.lock();
        self.hub.publish_all(|q| run_query(&inner.conn, q));
    }
}

impl DocumentStore for SqliteStore {
    async fn watch(&self, query: Query) -> Result<LiveQuery> {
        let inner = self.lock();
        let initial = run_query(&inner.conn, &query)?;
        Ok(self.hub.register(query, initial))
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Record>> {
        let inner = self.lock();
        run_query(&inner.conn, query)
    }

    async fn get_record(&self, collection: &str, id: &RecordId) -> Result<Option<Record>> {
        let inner = self.lock();
        Ok(load_fields(&inner.conn, collection, id)?.map(|fields| Record {
            id: id.clone(),
            fields,
        }))
    }

    async fn add_record(&self, collection: &str, mut fields: Fields) -> Result<RecordId> {
        let mut inner = self.lock();
        let now = inner.clock.next();
        resolve_server_values(&mut fields, now);

        let id = RecordId::generate();
        inner.conn.execute(
            "INSERT INTO records (collection, id, fields) VALUES (?1, ?2, ?3)",
            params![collection, id.as_str(), serde_json::to_string(&fields)?],
        )?;

        debug!(collection, id = %id, "record added");
        self.hub.publish(collection, |q| run_query(&inner.conn, q));
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
        let mut inner = self.lock();
        let now = inner.clock.next();

        // Write lock held from the read on; no other connection commits
        // between the check and the update.
        let tx = inner
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut existing) = load_fields(&tx, collection, id)? else {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        if existing.get(field) != Some(expected) {
            debug!(collection, id = %id, field, "guarded update skipped");
            return Ok(false);
        }

        resolve_server_values(&mut patch, now);
        existing.extend(patch);
        tx.execute(
            "UPDATE records SET fields = ?3 WHERE collection = ?1 AND id = ?2",
            params![collection, id.as_str(), serde_json::to_string(&existing)?],
        )?;
        tx.commit()?;

        debug!(collection, id = %id, field, "guarded update committed");
        self.hub.publish(collection, |q| run_query(&inner.conn, q));
        Ok(true)
    }

    async fn batch_update(
        &self,
        collection: &str,
        updates: Vec<(RecordId, Fields)>,
    ) -> Result<usize> {
        let mut inner = self.lock();
        let now = inner.clock.next();

        let tx = inner.conn.transaction()?;
        for (id, mut patch) in updates.iter().cloned() {
            let Some(mut existing) = load_fields(&tx, collection, &id)? else {
                // Dropping `tx` rolls back the earlier updates.
                return Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            };
            resolve_server_values(&mut patch, now);
            existing.extend(patch);
            tx.execute(
                "UPDATE records SET fields = ?3 WHERE collection = ?1 AND id = ?2",
                params![collection, id.as_str(), serde_json::to_string(&existing)?],
            )?;
        }
        tx.commit()?;

        debug!(collection, updated = updates.len(), "batch update committed");
        self.hub.publish(collection, |q| run_query(&inner.conn, q));
        Ok(updates.len())
    }

    async fn batch_delete(&self, collection: &str, ids: &[RecordId]) -> Result<usize> {
        let mut inner = self.lock();

        let tx = inner.conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            removed += tx.execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id.as_str()],
            )?;
        }
        tx.commit()?;

        debug!(collection, removed, "batch delete committed");
        self.hub.publish(collection, |q| run_query(&inner.conn, q));
        Ok(removed)
    }
}

fn load_fields(conn: &Connection, collection: &str, id: &RecordId) -> Result<Option<Fields>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT fields FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
        .transpose()
}

fn run_query(conn: &Connection, query: &Query) -> Result<Vec<Record>> {
    let mut sql = String::from("SELECT id, fields FROM records WHERE collection = ?1");
    let mut args = vec![query.collection.clone()];
    for filter in &query.filters {
        let Value::Text(text) = &filter.value else {
            continue;
        };
        if !plain_field_name(&filter.field) {
            continue;
        }
        args.push(format!("$.{}.value", filter.field));
        args.push(text.clone());
        sql.push_str(&format!(
            " AND json_extract(fields, ?{}) = ?{}",
            args.len() - 1,
            args.len()
        ));
    }

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (id, json) = row?;
        records.push(Record {
            id: RecordId::from(id),
            fields: serde_json::from_str(&json)?,
        });
    }
    Ok(query.apply(records))
}

/// Field names usable verbatim in a JSON path. Other names are filtered
/// after decoding.
fn plain_field_name(field: &str) -> bool {
    field.starts_with(|c: char| c.is_ascii_alphabetic())
        && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fields, Value};
    use futures::StreamExt;

    fn msg(key: &str, sender: &str) -> Fields {
        let mut f = fields([("conversationKey", key), ("senderId", sender)]);
        f.insert("createdAt".into(), Value::ServerTimestamp);
        f.insert("read".into(), Value::Bool(false));
        f
    }

    fn by_key(key: &str) -> Query {
        Query::collection("messages")
            .where_eq("conversationKey", key)
            .order_by("createdAt")
    }

    #[tokio::test]
    async fn records_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");

        let id = {
            let store = SqliteStore::open_at(&path).unwrap();
            store.add_record("messages", msg("k", "a")).await.unwrap()
        };

        let store = SqliteStore::open_at(&path).unwrap();
        let all = store.fetch(&by_key("k")).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
        assert_eq!(all[0].text("senderId"), Some("a"));
        assert!(all[0].timestamp("createdAt").is_some());
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.add_record("messages", msg("k", "a")).await.unwrap();

        store
            .update_record("messages", &id, fields([("read", true)]))
            .await
            .unwrap();

        let rec = &store.fetch(&by_key("k")).await.unwrap()[0];
        assert_eq!(rec.bool("read"), Some(true));
        assert_eq!(rec.text("senderId"), Some("a"));
    }

    #[tokio::test]
    async fn update_of_missing_record_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.add_record("messages", msg("k", "a")).await.unwrap();

        let err = store
            .batch_update(
                "messages",
                vec![
                    (id, fields([("read", true)])),
                    (RecordId::from("nope"), fields([("read", true)])),
                ],
            )
            .await;
        assert!(matches!(err, Err(StoreError::NotFound { .. })));

        let rec = &store.fetch(&by_key("k")).await.unwrap()[0];
        assert_eq!(rec.bool("read"), Some(false));
    }

    #[tokio::test]
    async fn live_query_follows_inserts_and_deletes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut live = store.watch(by_key("k")).await.unwrap();
        assert!(live.next().await.unwrap().unwrap().is_empty());

        let a = store.add_record("messages", msg("k", "a")).await.unwrap();
        assert_eq!(live.next().await.unwrap().unwrap().len(), 1);

        assert_eq!(store.batch_delete("messages", &[a]).await.unwrap(), 1);
        assert!(live.next().await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_picks_up_foreign_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let reader = SqliteStore::open_at(&path).unwrap();
        let writer = SqliteStore::open_at(&path).unwrap();

        let mut live = reader.watch(by_key("k")).await.unwrap();
        assert!(live.next().await.unwrap().unwrap().is_empty());

        writer.add_record("messages", msg("k", "b")).await.unwrap();
        reader.refresh();
        assert_eq!(live.next().await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn text_filters_match_only_text_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_record("messages", msg("k", "a")).await.unwrap();
        store.add_record("messages", msg("k", "b")).await.unwrap();
        store
            .add_record("messages", fields([("conversationKey", Value::Integer(7))]))
            .await
            .unwrap();
        store
            .add_record("messages", fields([("conversationKey", "7"), ("odd key", "x")]))
            .await
            .unwrap();

        let q = by_key("k").where_eq("senderId", "b").where_eq("read", false);
        let hits = store.fetch(&q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text("senderId"), Some("b"));

        let sevens = store.fetch(&by_key("7")).await.unwrap();
        assert_eq!(sevens.len(), 1);
        assert_eq!(sevens[0].text("conversationKey"), Some("7"));

        let odd = Query::collection("messages").where_eq("odd key", "x");
        assert_eq!(store.fetch(&odd).await.unwrap().len(), 1);
        let none = Query::collection("messages").where_eq("odd key", "y");
        assert!(store.fetch(&none).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_record_and_guarded_update() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.add_record("requests", fields([("status", "pending")])).await.unwrap();
        let mut live = store
            .watch(Query::collection("requests").where_eq("status", "approved"))
            .await
            .unwrap();
        assert!(live.next().await.unwrap().unwrap().is_empty());

        let pending = Value::from("pending");
        assert!(store
            .update_record_if("requests", &id, "status", &pending, fields([("status", "approved")]))
            .await
            .unwrap());
        assert!(!store
            .update_record_if("requests", &id, "status", &pending, fields([("status", "rejected")]))
            .await
            .unwrap());
        assert_eq!(live.next().await.unwrap().unwrap().len(), 1);

        let rec = store.get_record("requests", &id).await.unwrap().unwrap();
        assert_eq!(rec.text("status"), Some("approved"));
        assert!(store
            .get_record("requests", &RecordId::from("nope"))
            .await
            .unwrap()
            .is_none());
    }
}
