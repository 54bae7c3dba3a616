//! Field-map schema shared by every extraction engine.
//!
//! A selector-spec is a closed, typed shape: CSS selector, optional
//! attribute, first-vs-all matches, optional post-extraction regex, and
//! an optional typed-field classifier. All three tiers consume exactly
//! this schema and emit the same record shape.

use serde::{Deserialize, Serialize};

/// Typed-field classifier kinds. Classification normalizes the raw value
/// and attaches a confidence score; required fields under 0.75 feed the
/// pause-decision logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypedFieldKind {
    Phone,
    Email,
    Address,
    Integer,
}

/// How to pull one field out of a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSpec {
    /// CSS selector, required
    pub css: String,
    /// Attribute to read; absent means normalized text content
    #[serde(default)]
    pub attr: Option<String>,
    /// Collect every match instead of the first
    #[serde(default)]
    pub all: bool,
    /// Post-extraction regex; first capture group wins, else the whole
    /// match; no match yields null
    #[serde(default)]
    pub regex: Option<String>,
    /// Typed-field classifier to run on the extracted value
    #[serde(default)]
    pub kind: Option<TypedFieldKind>,
}

impl SelectorSpec {
    /// Plain text selector with defaults everywhere else.
    #[must_use]
    pub fn css(css: impl Into<String>) -> Self {
        Self {
            css: css.into(),
            attr: None,
            all: false,
            regex: None,
            kind: None,
        }
    }

    #[must_use]
    pub fn with_attr(mut self, attr: impl Into<String>) -> Self {
        self.attr = Some(attr.into());
        self
    }

    #[must_use]
    pub fn all_matches(mut self) -> Self {
        self.all = true;
        self
    }
}

/// One (field name → selector-spec) binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field: String,
    pub spec: SelectorSpec,
}

/// The full field map for a job, ordered like the job's field list.
/// Uniqueness per (job, field) is enforced by the store's primary key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMap {
    pub mappings: Vec<FieldMapping>,
}

impl FieldMap {
    #[must_use]
    pub fn new(mappings: Vec<FieldMapping>) -> Self {
        Self { mappings }
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&SelectorSpec> {
        self.mappings
            .iter()
            .find(|m| m.field == field)
            .map(|m| &m.spec)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.mappings.iter().map(|m| m.field.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_spec_defaults() {
        let spec: SelectorSpec = serde_json::from_str(r#"{"css":"h1"}"#).expect("minimal spec");
        assert_eq!(spec.css, "h1");
        assert!(spec.attr.is_none());
        assert!(!spec.all);
        assert!(spec.regex.is_none());
        assert!(spec.kind.is_none());
    }

    #[test]
    fn typed_kind_parses() {
        let spec: SelectorSpec =
            serde_json::from_str(r#"{"css":".phone","kind":"phone"}"#).expect("typed spec");
        assert_eq!(spec.kind, Some(TypedFieldKind::Phone));
    }
}
