//! Storage trait definitions for kindstore
//!
//! `DocumentStore` is the backend seam: it persists uniform rows
//! ([`Document`]) and knows nothing about concrete record types. The typed
//! layer on top lives in [`crate::storage`].
//!
//! Backends:
//! - `SqliteStore`: embedded SQLite, one table per kind
//! - `MemoryDocumentStore`: in-memory fake for tests (see `fakes`)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::query::Query;
use crate::urn::Urn;

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Physical row form of a record.
///
/// `data` is the full JSON-serialized record; every other column is
/// kind-independent. Column values are authoritative for audit fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub kind: String,
    pub id: String,
    pub namespace: String,
    pub state: String,
    /// JSON text
    pub data: String,
    pub indexed_by: Option<String>,
    pub created_by: String,
    pub updated_by: String,
    /// Nanoseconds since the epoch
    pub created_at: i64,
    /// Nanoseconds since the epoch; the optimistic-concurrency version
    pub updated_at: i64,
}

impl Document {
    /// Canonical URN text for error messages and logs.
    pub fn urn_string(&self) -> String {
        urn_text(&self.namespace, &self.kind, &self.id)
    }

    /// Rebuild the validated URN from the row columns.
    pub fn urn(&self) -> StoreResult<Urn> {
        Urn::with_id(&self.namespace, &self.kind, &self.id)
    }

    /// Parsed `data` column.
    pub fn json(&self) -> StoreResult<serde_json::Value> {
        serde_json::from_str(&self.data)
            .map_err(|e| StoreError::Deserialization(format!("{}: {e}", self.urn_string())))
    }
}

pub(crate) fn urn_text(namespace: &str, kind: &str, id: &str) -> String {
    format!("urn:{namespace}:{kind}:{id}")
}

/// Row-level document persistence.
///
/// Guarantees every implementation must honor:
/// - `insert` fails with `AlreadyExists` when the id is taken.
/// - `update` writes only when the stored `updated_at` equals
///   `expected_version`; otherwise `Conflict` (row present) or `NotFound`.
///   It returns the row as stored after the write.
/// - `delete` is physical and returns the row as it was.
/// - `search` applies filters, then sort, then offset/limit.
/// - `count` applies the same filters and ignores sort and pagination.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a new row.
    async fn insert(&self, doc: Document) -> StoreResult<Document>;

    /// Overwrite an existing row if its version still matches.
    async fn update(&self, doc: Document, expected_version: i64) -> StoreResult<Document>;

    /// Load a row by kind and id. `NotFound` when absent.
    async fn fetch(&self, kind: &str, id: &str) -> StoreResult<Document>;

    /// Remove a row, returning its last stored form. `NotFound` when absent.
    async fn delete(&self, kind: &str, id: &str) -> StoreResult<Document>;

    /// Rows of `kind` matching `query`, sorted and paginated.
    async fn search(&self, kind: &str, query: &Query) -> StoreResult<Vec<Document>>;

    /// Number of rows of `kind` matching `query`'s filters.
    async fn count(&self, kind: &str, query: &Query) -> StoreResult<u64>;
}
