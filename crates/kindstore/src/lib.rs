//! kindstore: typed document storage over an embedded SQL engine
//!
//! Records are plain serde types carrying a shared envelope ([`Meta`]). Each
//! kind gets its own table of uniform rows: a handful of indexed columns
//! plus the full record as JSON. Writes use optimistic concurrency with
//! `updated_at` as the version token.
//!
//! ## Layers
//!
//! - Identity: [`Urn`] and the 20-character id generator
//! - Types: the [`Record`] trait and an explicit [`Registry`]
//! - Queries: [`Query`] with its compact string form
//! - Persistence: the [`DocumentStore`] trait with [`SqliteStore`] and an
//!   in-memory fake, wrapped by the typed [`Storage`] facade
//!
//! ## Key Components
//!
//! - `Storage`: insert / update / upsert / delete / fetch / search / count
//! - `SqliteStore`: one connection, tables created on first use, FTS5 for
//!   `match` queries
//! - `StoreConfig`: database location, full-text switch, timeouts

mod config;
mod error;
pub mod fakes;
pub mod id;
mod meta;
mod migrations;
pub mod query;
mod record;
pub mod registry;
mod sql;
pub mod sqlite_store;
pub mod storage;
pub mod storage_traits;
mod urn;

pub use config::{StoreConfig, DEFAULT_BUSY_TIMEOUT};
pub use error::StoreError;
pub use id::{is_valid_id, new_id, ID_LEN};
pub use meta::{from_nanos, to_nanos, Meta, DEFAULT_STATE};
pub use query::{Direction, Query, SortKey, DEFAULT_LIMIT, DEFAULT_SORT};
pub use record::{FieldSource, FieldValue, Record, RecordFields};
pub use registry::{AnyRecord, Embed, Registry, RegistryBuilder, TypeEntry, TypeOptions};
pub use sqlite_store::SqliteStore;
pub use storage::{RecordStream, Storage};
pub use storage_traits::{Document, DocumentStore, StoreResult};
pub use urn::{is_valid_name, Urn};

/// Result type for kindstore operations
pub type Result<T> = std::result::Result<T, StoreError>;
