//! Error types for kindstore

use thiserror::Error;

/// Errors that can occur in the document storage layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// No row for the given URN at the time of the operation
    #[error("record not found: {urn}")]
    NotFound { urn: String },

    /// An update presented a stale version token
    #[error("version conflict on {urn}: record was modified concurrently")]
    Conflict { urn: String },

    /// Insert hit an existing primary key
    #[error("record already exists: {urn}")]
    AlreadyExists { urn: String },

    /// Malformed URN, namespace or kind
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Malformed query string or query parameters
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Registry lookup for an unregistered kind
    #[error("kind not registered: {kind}")]
    KindNotFound { kind: String },

    /// A kind was registered twice
    #[error("kind registered twice: {kind}")]
    DuplicateKind { kind: String },

    /// Query placeholder names a field that cannot be rendered as text
    #[error("unsupported type {found} for field {field}")]
    UnsupportedFieldType { field: String, found: String },

    /// Query placeholder names a field that does not exist
    #[error("field not found: {field}")]
    FieldNotFound { field: String },

    /// Record could not be encoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Stored data could not be decoded
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Backend / I/O failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Operation exceeded the configured deadline
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },
}

impl StoreError {
    /// True when the record did not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// True when an update lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
