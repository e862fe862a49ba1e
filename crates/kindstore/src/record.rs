//! The record descriptor trait.
//!
//! A record is a plain serde type that embeds [`Meta`] (normally with
//! `#[serde(flatten)]`) and declares its kind as a constant. No runtime
//! reflection is involved: kind, envelope access and field lookup are all
//! provided by this trait.
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Person {
//!     #[serde(flatten)]
//!     meta: Meta,
//!     name: String,
//!     age: u32,
//! }
//!
//! impl Record for Person {
//!     const KIND: &'static str = "person";
//!     fn meta(&self) -> &Meta { &self.meta }
//!     fn meta_mut(&mut self) -> &mut Meta { &mut self.meta }
//! }
//!
//! let alice = Person::create("company", |meta| Person { meta, name: "Alice".into(), age: 30 })?;
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::meta::Meta;
use crate::urn::Urn;
use crate::Result;

/// Scalar value read from a record field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    /// Present but not a scalar; carries a type label for error messages.
    Unsupported(&'static str),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => f.write_str(s),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::UInt(u) => write!(f, "{u}"),
            FieldValue::Float(x) => write!(f, "{x}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Unsupported(label) => write!(f, "<{label}>"),
        }
    }
}

impl FieldValue {
    /// Read the value at a dotted path inside a JSON document.
    pub fn from_json_path(doc: &serde_json::Value, path: &str) -> Option<Self> {
        let mut current = doc;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(Self::from_json(current))
    }

    fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::String(s) => FieldValue::Str(s.clone()),
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    FieldValue::UInt(u)
                } else {
                    FieldValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::Null => FieldValue::Unsupported("null"),
            Value::Array(_) => FieldValue::Unsupported("array"),
            Value::Object(_) => FieldValue::Unsupported("object"),
        }
    }
}

/// Anything that can answer "what is the value of field X".
///
/// Used for `{Field}` placeholder substitution in query strings.
pub trait FieldSource {
    /// `None` when the field does not exist.
    fn field(&self, name: &str) -> Option<FieldValue>;
}

impl FieldSource for serde_json::Value {
    fn field(&self, name: &str) -> Option<FieldValue> {
        FieldValue::from_json_path(self, name)
    }
}

/// A storable record type.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical type name; selects the storage table.
    const KIND: &'static str;

    fn meta(&self) -> &Meta;

    fn meta_mut(&mut self) -> &mut Meta;

    /// Value for the `indexed_by` column.
    fn index(&self) -> Option<String> {
        None
    }

    /// Look up a field by dotted path. The default reads the record's JSON
    /// form, so field names follow the serde names.
    fn field(&self, name: &str) -> Option<FieldValue> {
        let doc = serde_json::to_value(self).ok()?;
        FieldValue::from_json_path(&doc, name)
    }

    /// Construct a fully-addressed record in `namespace`.
    fn create(namespace: &str, init: impl FnOnce(Meta) -> Self) -> Result<Self>
    where
        Self: Sized,
    {
        let urn = Urn::new(namespace, Self::KIND)?;
        Ok(init(Meta::new(urn)))
    }
}

/// Adapter so any record can feed query placeholders.
pub struct RecordFields<'a, T: Record>(pub &'a T);

impl<T: Record> FieldSource for RecordFields<'_, T> {
    fn field(&self, name: &str) -> Option<FieldValue> {
        self.0.field(name)
    }
}
