//! Typed storage facade
//!
//! `Storage` turns records into [`Document`] rows and back. It checks kinds
//! against the registry, stamps audit fields and computes version tokens;
//! the backend only persists rows.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::fakes::MemoryDocumentStore;
use crate::meta::{from_nanos, to_nanos};
use crate::query::Query;
use crate::record::Record;
use crate::registry::{Registry, TypeEntry};
use crate::sqlite_store::SqliteStore;
use crate::storage_traits::{Document, DocumentStore};
use crate::urn::Urn;
use crate::Result;

/// Lazily decoded search results.
pub type RecordStream<T> = BoxStream<'static, Result<T>>;

/// Record-level operations over any [`DocumentStore`].
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn DocumentStore>,
    registry: Arc<Registry>,
}

impl Storage {
    pub fn new(backend: Arc<dyn DocumentStore>, registry: Arc<Registry>) -> Self {
        Self { backend, registry }
    }

    /// Storage on a SQLite database described by `config`.
    pub fn sqlite(config: StoreConfig, registry: Arc<Registry>) -> Result<Self> {
        let backend = SqliteStore::open(config)?;
        Ok(Self::new(Arc::new(backend), registry))
    }

    /// Storage on the in-memory fake.
    pub fn in_memory(registry: Arc<Registry>) -> Self {
        Self::new(Arc::new(MemoryDocumentStore::new()), registry)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn DocumentStore> {
        &self.backend
    }

    /// Registered types, ordered for display.
    pub fn kinds(&self) -> impl Iterator<Item = &TypeEntry> + '_ {
        self.registry.types()
    }

    /// Persist a new record. Fails with `AlreadyExists` if the id is taken.
    #[instrument(skip(self, record), fields(kind = T::KIND, urn = %record.meta().urn))]
    pub async fn insert<T: Record>(&self, mut record: T, created_by: &str) -> Result<T> {
        self.check_type::<T>()?;
        self.check_urn::<T>(&record.meta().urn)?;

        let now = Utc::now();
        let meta = record.meta_mut();
        meta.created_by = created_by.to_string();
        meta.created_at = now;
        meta.updated_by = created_by.to_string();
        meta.updated_at = now;

        let stored = self.backend.insert(to_document(&record)?).await?;
        info!(version = stored.updated_at, "record inserted");
        from_document(stored)
    }

    /// Write a changed record, provided nobody else wrote it since it was read.
    ///
    /// The record's `updated_at` is the version token. Returns the record as
    /// stored, carrying the new token.
    #[instrument(skip(self, record), fields(kind = T::KIND, urn = %record.meta().urn))]
    pub async fn update<T: Record>(&self, mut record: T, updated_by: &str) -> Result<T> {
        self.check_type::<T>()?;
        self.check_urn::<T>(&record.meta().urn)?;

        let expected = record.meta().version();
        let next = to_nanos(&Utc::now()).max(expected.saturating_add(1));
        let meta = record.meta_mut();
        meta.updated_by = updated_by.to_string();
        meta.updated_at = from_nanos(next);

        let doc = to_document(&record)?;
        let urn = doc.urn_string();
        let stored = self
            .backend
            .update(doc, expected)
            .await
            .map_err(|e| with_urn(e, &urn))?;
        debug!(from = expected, to = stored.updated_at, "record updated");
        from_document(stored)
    }

    /// Insert if the record does not exist yet, otherwise update it.
    #[instrument(skip(self, record), fields(kind = T::KIND, urn = %record.meta().urn))]
    pub async fn upsert<T: Record + Clone>(&self, record: T, by: &str) -> Result<T> {
        self.check_type::<T>()?;
        self.check_urn::<T>(&record.meta().urn)?;

        let existing = self.backend.fetch(T::KIND, record.meta().id()).await;
        match existing {
            Ok(_) => self.update(record, by).await,
            Err(e) if e.is_not_found() => match self.insert(record.clone(), by).await {
                Err(StoreError::AlreadyExists { .. }) => {
                    warn!("lost insert race, retrying as update");
                    self.update(record, by).await
                }
                other => other,
            },
            Err(e) => Err(e),
        }
    }

    /// Physically remove a record, returning its last stored value.
    #[instrument(skip(self), fields(kind = T::KIND, urn = %urn))]
    pub async fn delete<T: Record>(&self, urn: &Urn, deleted_by: &str) -> Result<T> {
        self.check_type::<T>()?;
        self.check_urn::<T>(urn)?;

        let removed = self
            .backend
            .delete(T::KIND, urn.id())
            .await
            .map_err(|e| with_urn(e, &urn.to_string()))?;
        info!(deleted_by, "record deleted");
        from_document(removed)
    }

    /// Load a record by URN.
    #[instrument(skip(self), fields(kind = T::KIND, urn = %urn))]
    pub async fn fetch<T: Record>(&self, urn: &Urn) -> Result<T> {
        self.check_type::<T>()?;
        self.check_urn::<T>(urn)?;

        let doc = self
            .backend
            .fetch(T::KIND, urn.id())
            .await
            .map_err(|e| with_urn(e, &urn.to_string()))?;
        from_document(doc)
    }

    /// Records matching `query`, decoded as the stream is consumed.
    ///
    /// A row that fails to decode is yielded as an error in its position;
    /// rows before it have already been delivered.
    #[instrument(skip(self, query), fields(kind = T::KIND, query = %query))]
    pub async fn search<T: Record>(&self, query: &Query) -> Result<RecordStream<T>> {
        self.check_type::<T>()?;
        query.validate()?;

        let rows = self.backend.search(T::KIND, query).await?;
        debug!(rows = rows.len(), "search returned rows");
        Ok(stream::iter(rows).map(from_document::<T>).boxed())
    }

    /// [`Storage::search`], collected.
    pub async fn search_all<T: Record>(&self, query: &Query) -> Result<Vec<T>> {
        self.search::<T>(query).await?.try_collect().await
    }

    /// Number of records matching `query`'s filters.
    #[instrument(skip(self, query), fields(kind = T::KIND, query = %query))]
    pub async fn count<T: Record>(&self, query: &Query) -> Result<u64> {
        self.check_type::<T>()?;
        self.backend.count(T::KIND, query).await
    }

    fn check_type<T: Record>(&self) -> Result<()> {
        match self.registry.kind_of::<T>() {
            Some(kind) if kind == T::KIND => Ok(()),
            _ => Err(StoreError::KindNotFound {
                kind: T::KIND.to_string(),
            }),
        }
    }

    fn check_urn<T: Record>(&self, urn: &Urn) -> Result<()> {
        if urn.kind() != T::KIND {
            return Err(StoreError::InvalidFormat(format!(
                "urn {urn} does not address a {}",
                T::KIND
            )));
        }
        Ok(())
    }
}

/// Put the caller's URN into backend errors that only know kind and id.
fn with_urn(err: StoreError, urn: &str) -> StoreError {
    match err {
        StoreError::NotFound { .. } => StoreError::NotFound {
            urn: urn.to_string(),
        },
        StoreError::Conflict { .. } => StoreError::Conflict {
            urn: urn.to_string(),
        },
        other => other,
    }
}

/// Row form of a record.
pub fn to_document<T: Record>(record: &T) -> Result<Document> {
    let meta = record.meta();
    let data = serde_json::to_string(record)?;
    Ok(Document {
        kind: T::KIND.to_string(),
        id: meta.id().to_string(),
        namespace: meta.namespace().to_string(),
        state: meta.state.clone(),
        data,
        indexed_by: record.index(),
        created_by: meta.created_by.clone(),
        updated_by: meta.updated_by.clone(),
        created_at: to_nanos(&meta.created_at),
        updated_at: to_nanos(&meta.updated_at),
    })
}

/// Decode a row, taking identity and audit fields from the columns.
pub fn from_document<T: Record>(doc: Document) -> Result<T> {
    let mut record: T = serde_json::from_str(&doc.data)
        .map_err(|e| StoreError::Deserialization(format!("{}: {e}", doc.urn_string())))?;
    let urn = doc.urn()?;
    let meta = record.meta_mut();
    meta.urn = urn;
    meta.state = doc.state;
    meta.created_by = doc.created_by;
    meta.created_at = from_nanos(doc.created_at);
    meta.updated_by = doc.updated_by;
    meta.updated_at = from_nanos(doc.updated_at);
    Ok(record)
}
