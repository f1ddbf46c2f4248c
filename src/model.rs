//! Taxonomy node model
//!
//! This module defines the `Concept` type, one entry of the remote
//! classification scheme, and the parsing rules for its JSON wire format.
//! The wire format is lenient in two places: `narrower`/`related` arrive as
//! either a bare identifier string or a list of them, and `broader` may be
//! absent, null, or a single identifier. Unknown fields (scope notes,
//! history notes, scheme metadata) are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, TaxonomyError};

/// One taxonomy entry.
///
/// Immutable once fetched: re-fetching a concept replaces any cached copy
/// wholesale, fields are never mutated in place. `id` is the stable opaque
/// identifier (IRI) issued by the remote authority; `notation` is the
/// human-facing classification number, unique within a scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    #[serde(alias = "@id")]
    pub id: String,

    #[serde(default)]
    pub notation: String,

    /// Preferred display label per language tag.
    #[serde(default, rename = "prefLabel")]
    pub pref_label: BTreeMap<String, String>,

    /// Alternate labels per language tag.
    #[serde(default, rename = "altLabel")]
    pub alt_label: BTreeMap<String, Vec<String>>,

    /// Parent pointer: zero or one resource identifier, resolved lazily.
    #[serde(default)]
    pub broader: Option<String>,

    /// Child pointers (weak references).
    #[serde(default, deserialize_with = "one_or_many")]
    pub narrower: Vec<String>,

    /// Associative pointers (weak references).
    #[serde(default, deserialize_with = "one_or_many")]
    pub related: Vec<String>,
}

impl Concept {
    /// Parses a concept from the raw JSON body served by the remote scheme.
    pub fn from_json(raw: &str) -> Result<Concept> {
        serde_json::from_str(raw)
            .map_err(|e| TaxonomyError::Serialization(format!("concept payload: {e}")))
    }

    /// The preferred label in `lang`, if the scheme carries one.
    pub fn preferred_label(&self, lang: &str) -> Option<&str> {
        self.pref_label.get(lang).map(String::as_str)
    }

    /// Alternate labels in `lang`; empty when the scheme carries none.
    pub fn alternate_labels(&self, lang: &str) -> &[String] {
        self.alt_label.get(lang).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Best display label: English, then any language, then the notation.
    pub fn label(&self) -> &str {
        if let Some(label) = self.preferred_label("en") {
            return label;
        }
        if let Some(label) = self.pref_label.values().next() {
            return label;
        }
        &self.notation
    }
}

/// Accepts a bare string, a list of strings, or null/absent.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
    })
}

/// A durable cache payload: either a full concept or the negative marker
/// recording that the remote scheme has no entry for a code.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredPayload {
    Present(Concept),
    Missing,
}

impl StoredPayload {
    /// Parses a stored payload, distinguishing the `{"exists":false}`
    /// negative marker from a full concept body.
    pub fn parse(raw: &str) -> Result<StoredPayload> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| TaxonomyError::Serialization(format!("cached payload: {e}")))?;
        if value.get("exists").and_then(|v| v.as_bool()) == Some(false) {
            return Ok(StoredPayload::Missing);
        }
        let concept = serde_json::from_value(value)
            .map_err(|e| TaxonomyError::Serialization(format!("cached payload: {e}")))?;
        Ok(StoredPayload::Present(concept))
    }

    /// The canonical negative-marker body.
    pub fn negative_json() -> String {
        serde_json::json!({ "exists": false }).to_string()
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, StoredPayload::Missing)
    }
}
