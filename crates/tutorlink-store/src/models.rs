//! Schemaless record model shared by every backend.
//!
//! A collection holds [`Record`]s: a store-assigned [`RecordId`] plus a map of
//! named [`Value`]s. Queries are equality filters with an optional ascending
//! sort on one field, which is all the messaging core ever asks for.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tutorlink_shared::{ConversationKey, Identifier};

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// Opaque, store-assigned record identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Fresh random id (UUID v4, hyphenless).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Write-only placeholder; the store swaps it for its own commit time.
    ServerTimestamp,
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) => 2,
            Value::Text(_) => 3,
            Value::Timestamp(_) => 4,
            Value::ServerTimestamp => 5,
        }
    }

    /// Total order used for sorting: values of the same kind compare
    /// naturally, different kinds compare by kind.
    pub fn order_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<&Identifier> for Value {
    fn from(v: &Identifier) -> Self {
        Value::Text(v.as_str().to_string())
    }
}

impl From<&ConversationKey> for Value {
    fn from(v: &ConversationKey) -> Self {
        Value::Text(v.as_str().to_string())
    }
}

impl From<&RecordId> for Value {
    fn from(v: &RecordId) -> Self {
        Value::Text(v.as_str().to_string())
    }
}

/// Named field values of one record.
pub type Fields = BTreeMap<String, Value>;

/// Build a [`Fields`] map from `(name, value)` pairs.
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Replace every [`Value::ServerTimestamp`] with `now`.
pub(crate) fn resolve_server_values(fields: &mut Fields, now: DateTime<Utc>) {
    for value in fields.values_mut() {
        if matches!(value, Value::ServerTimestamp) {
            *value = Value::Timestamp(now);
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub fields: Fields,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn bool(&self, field: &str) -> Option<bool> {
        match self.fields.get(field) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        match self.fields.get(field) {
            Some(Value::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Equality filter on one field.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

/// Filtered, optionally ordered view over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<String>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Sort ascending by `field`.
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    /// The value this query requires for `field`, if it filters on it.
    pub fn filter_value(&self, field: &str) -> Option<&Value> {
        self.filters
            .iter()
            .find(|f| f.field == field)
            .map(|f| &f.value)
    }

    /// Whether a field map satisfies every filter. A missing field never
    /// matches.
    pub fn matches(&self, fields: &Fields) -> bool {
        self.filters
            .iter()
            .all(|f| fields.get(&f.field) == Some(&f.value))
    }

    /// Sort records the way this query orders them.
    ///
    /// Records lacking the order field (or holding null there, e.g. a
    /// timestamp not yet assigned) go last. Ties fall back to record id so
    /// the order is deterministic.
    pub fn sort(&self, records: &mut [Record]) {
        let Some(field) = self.order_by.as_deref() else {
            records.sort_by(|a, b| a.id.cmp(&b.id));
            return;
        };
        records.sort_by(|a, b| {
            let va = a.get(field).filter(|v| !v.is_null());
            let vb = b.get(field).filter(|v| !v.is_null());
            let by_field = match (va, vb) {
                (Some(x), Some(y)) => x.order_cmp(y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            by_field.then_with(|| a.id.cmp(&b.id))
        });
    }

    /// Filter and order a set of candidate records.
    pub fn apply<I>(&self, candidates: I) -> Vec<Record>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut out: Vec<Record> = candidates
            .into_iter()
            .filter(|r| self.matches(&r.fields))
            .collect();
        self.sort(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rec(id: &str, ts: Option<i64>, sender: &str) -> Record {
        let mut f = fields([("senderId", sender)]);
        if let Some(secs) = ts {
            f.insert(
                "createdAt".into(),
                Value::Timestamp(Utc.timestamp_opt(secs, 0).unwrap()),
            );
        }
        Record {
            id: RecordId::from(id),
            fields: f,
        }
    }

    #[test]
    fn equality_filters_require_presence() {
        let q = Query::collection("messages").where_eq("read", false);
        assert!(q.matches(&fields([("read", false)])));
        assert!(!q.matches(&fields([("read", true)])));
        assert!(!q.matches(&Fields::new()));
    }

    #[test]
    fn orders_by_field_then_id_with_pending_last() {
        let q = Query::collection("messages").order_by("createdAt");
        let out = q.apply(vec![
            rec("c", Some(20), "a"),
            rec("z", None, "a"),
            rec("b", Some(10), "a"),
            rec("a", Some(20), "a"),
        ]);
        let ids: Vec<&str> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["b", "a", "c", "z"]);
    }

    #[test]
    fn server_timestamp_is_resolved() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut f = fields([("createdAt", Value::ServerTimestamp)]);
        resolve_server_values(&mut f, now);
        assert_eq!(f.get("createdAt"), Some(&Value::Timestamp(now)));
    }

    #[test]
    fn value_survives_json() {
        let f = fields([
            ("text", Value::from("Hello")),
            ("read", Value::from(false)),
            ("n", Value::Null),
        ]);
        let json = serde_json::to_string(&f).unwrap();
        let back: Fields = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }
}
