//! Record identity: `urn:<namespace>:<kind>:<id>`
//!
//! `namespace` and `kind` are short lowercase names
//! (`^[a-z][a-z0-9_]{1,19}$`); `id` is a 20-character minted id
//! (see [`crate::id`]). A URN serializes as its canonical string, never
//! as an object.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::id::{is_valid_id, new_id, ID_LEN};
use crate::Result;

const SCHEME: &str = "urn:";
/// `urn:` + `aa:` + `bb:` + id
const MIN_LEN: usize = SCHEME.len() + 3 + 3 + 1;
const UNBOUND_ID: &str = "*";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{1,19}$").expect("static regex"))
}

/// Whether `name` is a valid namespace or kind.
pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

pub(crate) fn check_name(what: &str, name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidFormat(format!(
            "{what} {name:?} must match [a-z][a-z0-9_]{{1,19}}"
        )))
    }
}

/// Three-part record identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn {
    namespace: String,
    kind: String,
    id: String,
}

impl Urn {
    /// Mint a URN with a fresh id. Inputs are lowercased before validation.
    pub fn new(namespace: &str, kind: &str) -> Result<Self> {
        let namespace = namespace.to_lowercase();
        let kind = kind.to_lowercase();
        check_name("namespace", &namespace)?;
        check_name("kind", &kind)?;
        Ok(Urn {
            namespace,
            kind,
            id: new_id(),
        })
    }

    /// Rebuild a URN from its stored parts.
    pub fn with_id(namespace: &str, kind: &str, id: &str) -> Result<Self> {
        let urn = Urn {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            id: id.to_string(),
        };
        urn.validate()?;
        Ok(urn)
    }

    /// Parse the canonical text form. A `*` id mints a fresh one.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |why: &str| StoreError::InvalidFormat(format!("urn {text:?}: {why}"));

        let rest = text
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid("missing urn: prefix"))?;
        if text.len() < MIN_LEN && !rest.ends_with(UNBOUND_ID) {
            return Err(invalid("too short"));
        }

        let mut parts = rest.splitn(3, ':');
        let namespace = parts.next().unwrap_or_default();
        let kind = parts.next().ok_or_else(|| invalid("missing kind"))?;
        let id = parts.next().ok_or_else(|| invalid("missing id"))?;
        if id.contains(':') {
            return Err(invalid("unexpected trailing segment"));
        }

        check_name("namespace", namespace)?;
        check_name("kind", kind)?;

        let id = if id == UNBOUND_ID {
            new_id()
        } else if is_valid_id(id) {
            id.to_string()
        } else {
            return Err(invalid(&format!("id must be {ID_LEN} base32 characters")));
        };

        Ok(Urn {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            id,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Re-check every component; used after decoding foreign data.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    fn validate(&self) -> Result<()> {
        check_name("namespace", &self.namespace)?;
        check_name("kind", &self.kind)?;
        if !is_valid_id(&self.id) {
            return Err(StoreError::InvalidFormat(format!(
                "id {:?} must be {ID_LEN} base32 characters",
                self.id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}:{}:{}", self.namespace, self.kind, self.id)
    }
}

impl FromStr for Urn {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Urn::parse(s)
    }
}

impl TryFrom<String> for Urn {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self> {
        Urn::parse(&s)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_then_parse_round_trips() {
        for (ns, kind) in [("company", "person"), ("my_project", "app"), ("ab", "k9_x")] {
            let urn = Urn::new(ns, kind).unwrap();
            let parsed = Urn::parse(&urn.to_string()).unwrap();
            assert_eq!(parsed, urn);
            assert_eq!(parsed.namespace(), ns);
            assert_eq!(parsed.kind(), kind);
            assert_eq!(parsed.id(), urn.id());
        }
    }

    #[test]
    fn new_lowercases_inputs() {
        let urn = Urn::new("Company", "PERSON").unwrap();
        assert_eq!(urn.namespace(), "company");
        assert_eq!(urn.kind(), "person");
    }

    #[test]
    fn new_rejects_bad_names() {
        assert!(Urn::new("a", "person").is_err());
        assert!(Urn::new("1abc", "person").is_err());
        assert!(Urn::new("company", "has-dash").is_err());
        assert!(Urn::new("company", "abcdefghijklmnopqrstu").is_err());
    }

    #[test]
    fn parse_rejects_malformed_text() {
        let id = new_id();
        let cases = [
            String::new(),
            "urn".to_string(),
            "urn:".to_string(),
            "urn:p".to_string(),
            "urn:p:k".to_string(),
            "urn:p:k:".to_string(),
            format!("urn:pp:kk:{}", &id[..19]),
            format!("urn:pp:kk:{id}0"),
            format!("urn:pp:kk:{id}:extra"),
            format!("urn:P1:kk:{id}"),
            format!("urn:pp:k-k:{id}"),
            format!("urn:p:kk:{id}"),
            format!("nru:pp:kk:{id}"),
        ];
        for text in cases {
            let err = Urn::parse(&text).unwrap_err();
            assert!(
                matches!(err, StoreError::InvalidFormat(_)),
                "{text:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn star_id_mints_fresh_id() {
        let a = Urn::parse("urn:company:person:*").unwrap();
        let b = Urn::parse("urn:company:person:*").unwrap();
        assert!(a.is_valid());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.kind(), "person");
    }

    #[test]
    fn serializes_as_plain_string() {
        let urn = Urn::new("company", "person").unwrap();
        let json = serde_json::to_string(&urn).unwrap();
        assert_eq!(json, format!("\"{urn}\""));

        let back: Urn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, urn);

        let bad: std::result::Result<Urn, _> = serde_json::from_str("\"urn:x\"");
        assert!(bad.is_err());
    }

    #[test]
    fn with_id_validates_parts() {
        let id = new_id();
        assert!(Urn::with_id("company", "person", &id).is_ok());
        assert!(Urn::with_id("company", "person", "short").is_err());
        assert!(Urn::with_id("Company", "person", &id).is_err());
    }
}
