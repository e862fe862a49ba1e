//! Structured query model and its compact string form.
//!
//! String form, sections in fixed order, each `;`-terminated and omitted
//! when empty:
//!
//! ```text
//! namespace=acme,globex;state=active;index=eu;filter=age:30,age:31,city:Oslo;match=Alice;
//! ```
//!
//! Sort and pagination are not part of the string form; they are carried
//! over from the `base` query given to [`Query::parse`].
//!
//! The string form has no escaping. A value containing `,`, `:` or `;`, a
//! match text containing `;`, or a list value of `*` or blank is written
//! as is and reads back differently. Such queries are built in code and
//! passed as [`Query`], not as text.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::record::{FieldSource, FieldValue};
use crate::Result;

pub const DEFAULT_LIMIT: usize = 1000;
pub const DEFAULT_SORT: &str = "+id";

/// Filter, sort and pagination parameters for search and count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// OR-matched; empty means unrestricted.
    pub namespaces: Vec<String>,
    /// OR-matched; empty means unrestricted.
    pub states: Vec<String>,
    /// OR-matched against the record-supplied index string.
    pub indexes: Vec<String>,
    /// Field path -> allowed values. AND across keys, OR within a key.
    pub filters: BTreeMap<String, Vec<String>>,
    /// Free-text search.
    pub match_text: Option<String>,
    /// `[+|-]field` entries.
    pub sort_by: Vec<String>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for Query {
    fn default() -> Self {
        Query {
            namespaces: Vec::new(),
            states: Vec::new(),
            indexes: Vec::new(),
            filters: BTreeMap::new(),
            match_text: None,
            sort_by: vec![DEFAULT_SORT.to_string()],
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        push_unique(&mut self.namespaces, namespace.into());
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        push_unique(&mut self.states, state.into());
        self
    }

    pub fn index(mut self, index: impl Into<String>) -> Self {
        push_unique(&mut self.indexes, index.into());
        self
    }

    pub fn filter(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        let values = self.filters.entry(path.into()).or_default();
        push_unique(values, value.into());
        self
    }

    pub fn matching(mut self, text: impl Into<String>) -> Self {
        self.match_text = Some(text.into());
        self
    }

    /// Replace the sort order.
    pub fn sort<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort_by = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// True when no filter section would be emitted.
    pub fn is_unfiltered(&self) -> bool {
        self.namespaces.is_empty()
            && self.states.is_empty()
            && self.indexes.is_empty()
            && self.filters.is_empty()
            && self.match_text.as_deref().map_or(true, str::is_empty)
    }

    /// Parsed sort keys; an empty list falls back to `+id`.
    pub fn sort_keys(&self) -> Result<Vec<SortKey>> {
        if self.sort_by.is_empty() {
            return SortKey::parse(DEFAULT_SORT).map(|k| vec![k]);
        }
        self.sort_by.iter().map(|s| SortKey::parse(s)).collect()
    }

    /// Check pagination and field paths before execution.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(StoreError::InvalidQuery("limit must be positive".to_string()));
        }
        for path in self.filters.keys() {
            check_path(path)?;
        }
        self.sort_keys()?;
        Ok(())
    }

    /// Parse the compact string form on top of `base`.
    ///
    /// `context` supplies values for `{Field}` placeholders in `match=`.
    pub fn parse(text: &str, context: Option<&dyn FieldSource>, base: Query) -> Result<Query> {
        let mut query = base;
        for segment in text.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let caps = segment_pattern().captures(segment).ok_or_else(|| {
                StoreError::InvalidQuery(format!("unrecognized segment {segment:?}"))
            })?;
            let body = caps.get(2).map_or("", |m| m.as_str());
            match &caps[1] {
                "namespace" => {
                    for ns in open_list(body) {
                        push_unique(&mut query.namespaces, ns);
                    }
                }
                "index" => {
                    for idx in open_list(body) {
                        push_unique(&mut query.indexes, idx);
                    }
                }
                "state" => {
                    for state in body.split(',') {
                        let state = state.trim();
                        if state.is_empty() {
                            return Err(StoreError::InvalidQuery(format!(
                                "empty state in {segment:?}"
                            )));
                        }
                        push_unique(&mut query.states, state.to_string());
                    }
                }
                "filter" => {
                    for pair in body.split(',') {
                        let (key, value) = split_pair(pair)?;
                        let values = query.filters.entry(key.to_string()).or_default();
                        push_unique(values, value.to_string());
                    }
                }
                "match" => {
                    query.match_text = Some(substitute(body, context)?);
                }
                other => {
                    return Err(StoreError::InvalidQuery(format!("unknown section {other:?}")))
                }
            }
        }
        Ok(query)
    }
}

/// Compact string form. Only values free of `,`, `:` and `;` survive
/// [`Query::parse`] unchanged.
impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.namespaces.is_empty() {
            write!(f, "namespace={};", self.namespaces.join(","))?;
        }
        if !self.states.is_empty() {
            write!(f, "state={};", self.states.join(","))?;
        }
        if !self.indexes.is_empty() {
            write!(f, "index={};", self.indexes.join(","))?;
        }
        if !self.filters.is_empty() {
            let pairs: Vec<String> = self
                .filters
                .iter()
                .flat_map(|(k, vs)| vs.iter().map(move |v| format!("{k}:{v}")))
                .collect();
            write!(f, "filter={};", pairs.join(","))?;
        }
        if let Some(text) = self.match_text.as_deref().filter(|t| !t.is_empty()) {
            write!(f, "match={text};")?;
        }
        Ok(())
    }
}

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(namespace|state|index|filter|match)=(.*)$").expect("static regex")
    })
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\}")
            .expect("static regex")
    })
}

fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*$")
            .expect("static regex")
    })
}

pub(crate) fn check_path(path: &str) -> Result<()> {
    if path_pattern().is_match(path) {
        Ok(())
    } else {
        Err(StoreError::InvalidQuery(format!("invalid field path {path:?}")))
    }
}

/// Comma list where `*` and blanks mean "no restriction".
fn open_list(body: &str) -> impl Iterator<Item = String> + '_ {
    body.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty() && *item != "*")
        .map(str::to_string)
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    let invalid = || StoreError::InvalidQuery(format!("filter pair {pair:?} must be key:value"));
    let mut parts = pair.split(':');
    let (key, value) = match (parts.next(), parts.next(), parts.next()) {
        (Some(k), Some(v), None) => (k.trim(), v.trim()),
        _ => return Err(invalid()),
    };
    if key.is_empty() || value.is_empty() {
        return Err(invalid());
    }
    Ok((key, value))
}

fn substitute(template: &str, context: Option<&dyn FieldSource>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder_pattern().captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        let value = context
            .and_then(|ctx| ctx.field(name))
            .ok_or_else(|| StoreError::FieldNotFound {
                field: name.to_string(),
            })?;
        if let FieldValue::Unsupported(found) = value {
            return Err(StoreError::UnsupportedFieldType {
                field: name.to_string(),
                found: found.to_string(),
            });
        }
        out.push_str(&template[last..whole.start()]);
        out.push_str(&value.to_string());
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// One parsed `sort_by` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (direction, field) = if let Some(rest) = text.strip_prefix('-') {
            (Direction::Desc, rest)
        } else if let Some(rest) = text.strip_prefix('+') {
            (Direction::Asc, rest)
        } else {
            (Direction::Asc, text)
        };
        check_path(field)?;
        Ok(SortKey {
            field: field.to_string(),
            direction,
        })
    }
}
