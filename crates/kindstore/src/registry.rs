//! Kind registry
//!
//! Maps a kind name to its record type and display metadata. A registry is
//! assembled once at startup with [`RegistryBuilder`] and then shared
//! immutably (usually behind an `Arc`), so lookups never take a lock.
//!
//! The registry also resolves [`Embed`] values: a record nested inside
//! another record as a `(kind, data)` pair, decoded by first reading the
//! kind and then dispatching to the registered type.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::meta::Meta;
use crate::record::Record;
use crate::urn::check_name;
use crate::Result;

/// Display metadata consumed by UI layers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TypeOptions {
    /// Singular label; defaults to the kind.
    pub title: String,
    /// Plural label; defaults to the title with an `s`.
    pub plural: String,
    pub description: String,
    /// Primary sort key for [`Registry::types`].
    pub order: i32,
    /// Hidden kinds are still resolvable but should not be listed in menus.
    pub hidden: bool,
}

impl TypeOptions {
    pub fn titled(title: impl Into<String>) -> Self {
        TypeOptions {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_plural(mut self, plural: impl Into<String>) -> Self {
        self.plural = plural.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    fn fill_defaults(mut self, kind: &str) -> Self {
        if self.title.is_empty() {
            self.title = kind.to_string();
        }
        if self.plural.is_empty() {
            self.plural = format!("{}s", self.title);
        }
        self
    }
}

type DecodeFn = fn(serde_json::Value) -> Result<Box<dyn AnyRecord>>;

/// One registered kind.
#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub kind: &'static str,
    pub type_name: &'static str,
    pub type_id: TypeId,
    pub options: TypeOptions,
    decode: DecodeFn,
}

impl TypeEntry {
    /// Decode a JSON document into this entry's concrete type.
    pub fn decode(&self, data: serde_json::Value) -> Result<Box<dyn AnyRecord>> {
        (self.decode)(data)
    }
}

fn decode_as<T: Record>(data: serde_json::Value) -> Result<Box<dyn AnyRecord>> {
    let record: T = serde_json::from_value(data)
        .map_err(|e| StoreError::Deserialization(format!("{}: {e}", T::KIND)))?;
    Ok(Box::new(record))
}

/// Type-erased record, as produced by [`Registry::open`].
pub trait AnyRecord: Any + Send + Sync {
    fn record_kind(&self) -> &'static str;
    fn envelope(&self) -> &Meta;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Record> AnyRecord for T {
    fn record_kind(&self) -> &'static str {
        T::KIND
    }

    fn envelope(&self) -> &Meta {
        self.meta()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl dyn AnyRecord {
    /// Recover the concrete type, or `None` if it is something else.
    pub fn downcast<T: Record>(self: Box<Self>) -> Option<T> {
        self.into_any().downcast::<T>().ok().map(|b| *b)
    }

    pub fn downcast_ref<T: Record>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// A record nested inside another record, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    pub kind: String,
    pub data: serde_json::Value,
}

impl Embed {
    pub fn wrap<T: Record>(record: &T) -> Result<Self> {
        Ok(Embed {
            kind: T::KIND.to_string(),
            data: serde_json::to_value(record)?,
        })
    }
}

/// Collects registrations; see [`Registry::builder`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: HashMap<&'static str, TypeEntry>,
}

impl RegistryBuilder {
    /// Register `T` under `T::KIND`.
    ///
    /// # Panics
    ///
    /// If the kind is malformed or already registered. Registrations are
    /// static program structure, so this surfaces at startup.
    pub fn register<T: Record>(mut self, options: TypeOptions) -> Self {
        if let Err(err) = self.try_register::<T>(options) {
            panic!("invalid registration of {}: {err}", std::any::type_name::<T>());
        }
        self
    }

    /// Fallible form of [`register`](Self::register).
    pub fn try_register<T: Record>(&mut self, options: TypeOptions) -> Result<()> {
        check_name("kind", T::KIND)?;
        if self.entries.contains_key(T::KIND) {
            return Err(StoreError::DuplicateKind {
                kind: T::KIND.to_string(),
            });
        }
        debug!(kind = T::KIND, type_name = std::any::type_name::<T>(), "registering kind");
        self.entries.insert(
            T::KIND,
            TypeEntry {
                kind: T::KIND,
                type_name: std::any::type_name::<T>(),
                type_id: TypeId::of::<T>(),
                options: options.fill_defaults(T::KIND),
                decode: decode_as::<T>,
            },
        );
        Ok(())
    }

    pub fn build(self) -> Registry {
        let by_type = self
            .entries
            .values()
            .map(|entry| (entry.type_id, entry.kind))
            .collect();
        let mut ordered: Vec<&'static str> = self.entries.keys().copied().collect();
        ordered.sort_by(|a, b| {
            let (ea, eb) = (&self.entries[a], &self.entries[b]);
            ea.options.order.cmp(&eb.options.order).then_with(|| a.cmp(b))
        });
        Registry {
            entries: self.entries,
            by_type,
            ordered,
        }
    }
}

/// Immutable kind -> type mapping.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<&'static str, TypeEntry>,
    by_type: HashMap<TypeId, &'static str>,
    ordered: Vec<&'static str>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn resolve(&self, kind: &str) -> Result<&TypeEntry> {
        self.entries
            .get(kind)
            .ok_or_else(|| StoreError::KindNotFound {
                kind: kind.to_string(),
            })
    }

    /// Kind registered for a concrete type.
    pub fn kind_of<T: Record>(&self) -> Option<&'static str> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// All entries ordered by `(options.order, kind)`.
    pub fn types(&self) -> impl Iterator<Item = &TypeEntry> + '_ {
        self.ordered.iter().map(|kind| &self.entries[kind])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode an embedded record through its registered type.
    pub fn open(&self, embed: &Embed) -> Result<Box<dyn AnyRecord>> {
        let entry = self.resolve(&embed.kind)?;
        let record = entry.decode(embed.data.clone())?;
        if record.envelope().kind() != entry.kind {
            return Err(StoreError::InvalidFormat(format!(
                "embedded {} carries urn of kind {}",
                entry.kind,
                record.envelope().kind()
            )));
        }
        Ok(record)
    }
}
