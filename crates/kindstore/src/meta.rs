//! Document envelope embedded in every record.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::urn::Urn;

/// Lifecycle state given to freshly constructed records.
pub const DEFAULT_STATE: &str = "active";

/// Identity, audit fields and lifecycle state shared by all records.
///
/// Timestamps serialize as integer nanoseconds since the epoch, matching
/// the `created_at` / `updated_at` row columns. `updated_at` doubles as the
/// optimistic-concurrency version token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub urn: Urn,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(with = "chrono::serde::ts_nanoseconds", default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: String,
    #[serde(with = "chrono::serde::ts_nanoseconds", default = "epoch")]
    pub updated_at: DateTime<Utc>,
}

fn default_state() -> String {
    DEFAULT_STATE.to_string()
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Meta {
    /// Envelope for a record that has never been persisted.
    pub fn new(urn: Urn) -> Self {
        Meta {
            urn,
            description: String::new(),
            tags: BTreeSet::new(),
            state: default_state(),
            created_by: String::new(),
            created_at: epoch(),
            updated_by: String::new(),
            updated_at: epoch(),
        }
    }

    pub fn id(&self) -> &str {
        self.urn.id()
    }

    pub fn kind(&self) -> &str {
        self.urn.kind()
    }

    pub fn namespace(&self) -> &str {
        self.urn.namespace()
    }

    /// The version token presented on update.
    pub fn version(&self) -> i64 {
        to_nanos(&self.updated_at)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Nanoseconds since the epoch, saturating outside chrono's i64 range.
pub fn to_nanos(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

pub fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_nanos(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_serialize_as_nanos() {
        let mut meta = Meta::new(Urn::new("company", "person").unwrap());
        meta.updated_at = from_nanos(1_700_000_000_123_456_789);

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["updated_at"], 1_700_000_000_123_456_789i64);
        assert_eq!(json["state"], "active");
        assert_eq!(meta.version(), 1_700_000_000_123_456_789);

        let back: Meta = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn missing_audit_fields_default() {
        let urn = Urn::new("company", "person").unwrap();
        let meta: Meta = serde_json::from_value(serde_json::json!({ "urn": urn })).unwrap();
        assert_eq!(meta.state, DEFAULT_STATE);
        assert_eq!(meta.version(), 0);
        assert!(meta.tags.is_empty());
    }
}
