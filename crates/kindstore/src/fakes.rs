//! In-memory fake for the storage trait (testing only)
//!
//! `MemoryDocumentStore` satisfies the `DocumentStore` contract without
//! SQLite. Filtering, ordering and matching follow the SQL backend's rules
//! so the same contract tests pass against both:
//!
//! - JSON filters compare the value's SQL text form (booleans are `1`/`0`)
//! - `match` requires every query token among the record's text leaves
//! - ordering puts missing values first, then numbers, then text, with `id`
//!   as the final tiebreaker

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::query::{Direction, Query};
use crate::sql::{self, column_for};
use crate::storage_traits::{urn_text, Document, DocumentStore, StoreResult};

type Tables = HashMap<String, BTreeMap<String, Document>>;

/// In-memory document store backed by `HashMap<kind, BTreeMap<id, Document>>`.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    tables: Mutex<Tables>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

fn missing(kind: &str, id: &str) -> StoreError {
    StoreError::NotFound {
        urn: format!("urn:*:{kind}:{id}"),
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(&self, doc: Document) -> StoreResult<Document> {
        sql::table(&doc.kind)?;
        let mut tables = self.tables()?;
        let table = tables.entry(doc.kind.clone()).or_default();
        if table.contains_key(&doc.id) {
            return Err(StoreError::AlreadyExists {
                urn: doc.urn_string(),
            });
        }
        table.insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    async fn update(&self, doc: Document, expected_version: i64) -> StoreResult<Document> {
        sql::table(&doc.kind)?;
        let mut tables = self.tables()?;
        let stored = tables
            .get_mut(&doc.kind)
            .and_then(|table| table.get_mut(&doc.id))
            .ok_or_else(|| StoreError::NotFound {
                urn: urn_text(&doc.namespace, &doc.kind, &doc.id),
            })?;

        if stored.updated_at != expected_version {
            return Err(StoreError::Conflict {
                urn: doc.urn_string(),
            });
        }

        // Creation audit is immutable, as in the SQL backend's UPDATE.
        let created_by = std::mem::take(&mut stored.created_by);
        let created_at = stored.created_at;
        *stored = Document {
            created_by,
            created_at,
            ..doc
        };
        Ok(stored.clone())
    }

    async fn fetch(&self, kind: &str, id: &str) -> StoreResult<Document> {
        sql::table(kind)?;
        let tables = self.tables()?;
        tables
            .get(kind)
            .and_then(|table| table.get(id))
            .cloned()
            .ok_or_else(|| missing(kind, id))
    }

    async fn delete(&self, kind: &str, id: &str) -> StoreResult<Document> {
        sql::table(kind)?;
        let mut tables = self.tables()?;
        tables
            .get_mut(kind)
            .and_then(|table| table.remove(id))
            .ok_or_else(|| missing(kind, id))
    }

    async fn search(&self, kind: &str, query: &Query) -> StoreResult<Vec<Document>> {
        sql::table(kind)?;
        query.validate()?;
        let keys = query.sort_keys()?;

        let mut rows = self.matching_rows(kind, query)?;
        rows.sort_by(|a, b| {
            let mut ord = Ordering::Equal;
            for key in &keys {
                let next = sort_value(a, &key.field).cmp_sql(&sort_value(b, &key.field));
                ord = ord.then(match key.direction {
                    Direction::Asc => next,
                    Direction::Desc => next.reverse(),
                });
            }
            ord.then_with(|| a.id.cmp(&b.id))
        });

        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn count(&self, kind: &str, query: &Query) -> StoreResult<u64> {
        sql::table(kind)?;
        let rows = self.matching_rows(kind, query)?;
        Ok(rows.len() as u64)
    }
}

impl MemoryDocumentStore {
    fn matching_rows(&self, kind: &str, query: &Query) -> StoreResult<Vec<Document>> {
        for path in query.filters.keys() {
            crate::query::check_path(path)?;
        }
        let tables = self.tables()?;
        let Some(table) = tables.get(kind) else {
            return Ok(Vec::new());
        };

        let mut rows = Vec::new();
        for doc in table.values() {
            let data: Value = serde_json::from_str(&doc.data)
                .map_err(|e| StoreError::Deserialization(format!("{}: {e}", doc.urn_string())))?;
            if matches(doc, &data, query) {
                rows.push(doc.clone());
            }
        }
        Ok(rows)
    }
}

fn matches(doc: &Document, data: &Value, query: &Query) -> bool {
    let in_set = |values: &[String], actual: Option<&str>| {
        values.is_empty() || actual.is_some_and(|a| values.iter().any(|v| v == a))
    };

    if !in_set(&query.namespaces, Some(&doc.namespace))
        || !in_set(&query.states, Some(&doc.state))
        || !in_set(&query.indexes, doc.indexed_by.as_deref())
    {
        return false;
    }

    for (field, values) in &query.filters {
        let actual = match column_for(field) {
            Some(column) => column_text(doc, column),
            None => lookup(data, field).and_then(sql_text),
        };
        if !in_set(values, actual.as_deref()) {
            return false;
        }
    }

    if let Some(text) = query.match_text.as_deref() {
        let wanted: Vec<String> = sql::tokens(text).collect();
        if !wanted.is_empty() {
            let mut have = Vec::new();
            collect_text(data, &mut have);
            let have: Vec<String> = have.iter().flat_map(|s| sql::tokens(s)).collect();
            if !wanted.iter().all(|w| have.contains(w)) {
                return false;
            }
        }
    }

    true
}

fn column_text(doc: &Document, column: &str) -> Option<String> {
    match column {
        "id" => Some(doc.id.clone()),
        "namespace" => Some(doc.namespace.clone()),
        "state" => Some(doc.state.clone()),
        "indexed_by" => doc.indexed_by.clone(),
        "created_by" => Some(doc.created_by.clone()),
        "updated_by" => Some(doc.updated_by.clone()),
        "created_at" => Some(doc.created_at.to_string()),
        "updated_at" => Some(doc.updated_at.to_string()),
        _ => None,
    }
}

fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |current, segment| current.get(segment))
}

/// The text SQLite yields for `CAST(json_extract(...) AS TEXT)`.
fn sql_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

fn collect_text<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, out)),
        _ => {}
    }
}

/// A value in SQLite's cross-type ordering: NULL < numbers < text.
#[derive(Debug)]
enum SortValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl SortValue {
    fn rank(&self) -> u8 {
        match self {
            SortValue::Null => 0,
            SortValue::Int(_) | SortValue::Real(_) => 1,
            SortValue::Text(_) => 2,
        }
    }

    fn cmp_sql(&self, other: &SortValue) -> Ordering {
        use SortValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Int(a), Real(b)) => (*a as f64).total_cmp(b),
            (Real(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Real(a), Real(b)) => a.total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

fn sort_value(doc: &Document, field: &str) -> SortValue {
    if let Some(column) = column_for(field) {
        return match column {
            "created_at" => SortValue::Int(doc.created_at),
            "updated_at" => SortValue::Int(doc.updated_at),
            other => column_text(doc, other).map_or(SortValue::Null, SortValue::Text),
        };
    }

    let Ok(data) = serde_json::from_str::<Value>(&doc.data) else {
        return SortValue::Null;
    };
    match lookup(&data, field) {
        None | Some(Value::Null) => SortValue::Null,
        Some(Value::Bool(b)) => SortValue::Int(i64::from(*b)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => SortValue::Int(i),
            None => SortValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Some(Value::String(s)) => SortValue::Text(s.clone()),
        Some(other) => SortValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, data: &str) -> Document {
        Document {
            kind: "person".to_string(),
            id: id.to_string(),
            namespace: "acme".to_string(),
            state: "active".to_string(),
            data: data.to_string(),
            indexed_by: None,
            created_by: "tester".to_string(),
            updated_by: "tester".to_string(),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn sql_text_matches_sqlite_casts() {
        assert_eq!(sql_text(&serde_json::json!(true)).as_deref(), Some("1"));
        assert_eq!(sql_text(&serde_json::json!(30)).as_deref(), Some("30"));
        assert_eq!(sql_text(&serde_json::json!(1.5)).as_deref(), Some("1.5"));
        assert_eq!(sql_text(&serde_json::json!("x")).as_deref(), Some("x"));
        assert_eq!(sql_text(&serde_json::json!(null)), None);
    }

    #[tokio::test]
    async fn update_preserves_creation_audit() {
        let store = MemoryDocumentStore::new();
        store.insert(doc("a", "{}")).await.unwrap();

        let mut next = doc("a", r#"{"name":"x"}"#);
        next.created_by = "someone-else".to_string();
        next.created_at = 99;
        next.updated_at = 2;
        let stored = store.update(next, 1).await.unwrap();
        assert_eq!(stored.created_by, "tester");
        assert_eq!(stored.created_at, 1);
        assert_eq!(stored.updated_at, 2);
    }

    #[tokio::test]
    async fn corrupt_data_is_a_deserialization_error() {
        let store = MemoryDocumentStore::new();
        store.insert(doc("a", "{not json")).await.unwrap();

        let err = store.count("person", &Query::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Deserialization(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn mixed_type_sort_follows_sqlite_order() {
        let store = MemoryDocumentStore::new();
        store.insert(doc("a", r#"{"v":"text"}"#)).await.unwrap();
        store.insert(doc("b", r#"{"v":2}"#)).await.unwrap();
        store.insert(doc("c", r#"{}"#)).await.unwrap();
        store.insert(doc("d", r#"{"v":1.5}"#)).await.unwrap();

        let rows = store
            .search("person", &Query::new().sort(["v"]))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "b", "a"]);
    }
}
