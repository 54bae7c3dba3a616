//! Field extraction shared by every engine tier.
//!
//! Tiers differ in how they obtain HTML; once a document is parsed, the
//! selector semantics here are the single source of truth, so a field
//! extracted by the HTTP tier and the browser tier from the same DOM is
//! byte-for-byte equal.

pub mod consensus;
pub mod schema;
pub mod typed;

use std::collections::HashMap;

use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};

use crate::utils::resolve_href;

use consensus::ConsensusSources;
use schema::{FieldMap, SelectorSpec};
use typed::collapse_whitespace;

/// Confidence below which a required field feeds the pause-decision logic.
pub const CONFIDENCE_FLOOR: f64 = 0.75;

/// Base confidence for a value adopted from consensus channels when the
/// primary selector yielded null. Two agreeing channels lift it to the
/// floor, three comfortably past it.
const CONSENSUS_FALLBACK_BASE: f64 = 0.55;

/// One extracted field with its provenance.
#[derive(Debug, Clone)]
pub struct ExtractedField {
    pub value: Option<Value>,
    pub confidence: f64,
    /// Channels that agreed with (or supplied) this value
    pub consensus_agreeing: u8,
    /// Whether a typed-field classifier ran on this field
    pub typed: bool,
}

/// Everything extraction learned about one page.
#[derive(Debug, Clone, Default)]
pub struct PageExtraction {
    /// The record shape persisted on success: field name → value
    pub record: Map<String, Value>,
    pub fields: HashMap<String, ExtractedField>,
}

impl PageExtraction {
    /// Fields that produced a non-null value.
    #[must_use]
    pub fn extracted_count(&self) -> usize {
        self.fields.values().filter(|f| f.value.is_some()).count()
    }

    /// Typed fields under the pause threshold. Untyped fields never
    /// participate in the pause-decision logic; their misses are covered
    /// by the extraction count.
    #[must_use]
    pub fn low_confidence_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .fields
            .iter()
            .filter(|(_, f)| f.typed && f.confidence < CONFIDENCE_FLOOR)
            .map(|(name, _)| name.clone())
            .collect();
        fields.sort();
        fields
    }
}

/// Extract every mapped field from a parsed document.
#[must_use]
pub fn extract_fields(html: &Html, field_map: &FieldMap) -> PageExtraction {
    let sources = ConsensusSources::gather(html);
    let mut out = PageExtraction::default();

    for mapping in &field_map.mappings {
        let extracted = extract_one(html, &sources, &mapping.field, &mapping.spec);
        out.record.insert(
            mapping.field.clone(),
            extracted.value.clone().unwrap_or(Value::Null),
        );
        out.fields.insert(mapping.field.clone(), extracted);
    }

    out
}

fn extract_one(
    html: &Html,
    sources: &ConsensusSources,
    field: &str,
    spec: &SelectorSpec,
) -> ExtractedField {
    let (primary, base_confidence) = apply_spec(html, spec);
    let typed = spec.kind.is_some();

    // Multi-valued fields skip the consensus channels; the secondary
    // sources carry scalars.
    if spec.all {
        return ExtractedField {
            value: primary,
            confidence: base_confidence,
            consensus_agreeing: 0,
            typed,
        };
    }

    let verdict = consensus::evaluate(&sources.candidates_for(field));

    match (&primary, &verdict.agreed_value) {
        (Some(Value::String(p)), Some(agreed)) if values_agree(p, agreed) => ExtractedField {
            value: primary,
            confidence: (base_confidence + verdict.bonus).min(1.0),
            consensus_agreeing: verdict.agreeing,
            typed,
        },
        (Some(Value::Number(p)), Some(agreed)) if p.to_string() == *agreed => ExtractedField {
            value: primary,
            confidence: (base_confidence + verdict.bonus).min(1.0),
            consensus_agreeing: verdict.agreeing,
            typed,
        },
        (Some(_), _) => ExtractedField {
            // Consensus never overrides a non-null primary
            value: primary,
            confidence: base_confidence,
            consensus_agreeing: 0,
            typed,
        },
        (None, Some(agreed)) if verdict.agreeing >= 2 => ExtractedField {
            value: Some(Value::String(agreed.clone())),
            confidence: (CONSENSUS_FALLBACK_BASE + verdict.bonus).min(1.0),
            consensus_agreeing: verdict.agreeing,
            typed,
        },
        (None, _) => ExtractedField {
            value: None,
            confidence: 0.0,
            consensus_agreeing: 0,
            typed,
        },
    }
}

fn values_agree(a: &str, b: &str) -> bool {
    collapse_whitespace(a).to_lowercase() == collapse_whitespace(b).to_lowercase()
}

/// Apply one selector-spec to a document: CSS query, first-vs-all,
/// attr-vs-text, regex post-rule, typed classification.
///
/// Returns the value (null on miss) and its confidence.
#[must_use]
pub fn apply_spec(html: &Html, spec: &SelectorSpec) -> (Option<Value>, f64) {
    let Ok(selector) = Selector::parse(&spec.css) else {
        // An unparsable selector extracts nothing; the classifier turns
        // zero required extractions into a selector-fix pause.
        return (None, 0.0);
    };

    let raw_values: Vec<String> = if spec.all {
        html.select(&selector)
            .filter_map(|el| node_value(&el, spec))
            .collect()
    } else {
        html.select(&selector)
            .next()
            .and_then(|el| node_value(&el, spec))
            .into_iter()
            .collect()
    };

    let post_regex: Vec<String> = raw_values
        .into_iter()
        .filter_map(|v| apply_regex(&v, spec))
        .collect();

    if post_regex.is_empty() {
        return (None, 0.0);
    }

    if let Some(kind) = spec.kind {
        let classified: Vec<typed::TypedValue> = post_regex
            .iter()
            .map(|v| typed::classify(v, kind))
            .collect();
        let confidence = classified
            .iter()
            .map(|t| t.confidence)
            .fold(f64::INFINITY, f64::min);
        let values: Vec<Value> = classified.into_iter().filter_map(|t| t.value).collect();
        if values.is_empty() {
            return (None, 0.0);
        }
        let value = if spec.all {
            Value::Array(values)
        } else {
            values.into_iter().next().unwrap_or(Value::Null)
        };
        return (Some(value), confidence);
    }

    let value = if spec.all {
        Value::Array(post_regex.into_iter().map(Value::String).collect())
    } else {
        post_regex.into_iter().next().map(Value::String).unwrap_or(Value::Null)
    };
    (Some(value), 1.0)
}

fn node_value(el: &ElementRef<'_>, spec: &SelectorSpec) -> Option<String> {
    let raw = match &spec.attr {
        Some(attr) => el.value().attr(attr)?.to_string(),
        None => collapse_whitespace(&el.text().collect::<String>()),
    };
    (!raw.is_empty()).then_some(raw)
}

fn apply_regex(value: &str, spec: &SelectorSpec) -> Option<String> {
    let Some(pattern) = &spec.regex else {
        return Some(value.to_string());
    };
    let re = regex::Regex::new(pattern).ok()?;
    let caps = re.captures(value)?;
    let m = caps.get(1).or_else(|| caps.get(0))?;
    Some(m.as_str().to_string())
}

/// Resolve link targets for list-mode crawling: apply the selector with
/// all-matches forced, read `href` (or the configured attr), resolve
/// against the base URL, and deduplicate preserving first occurrence.
#[must_use]
pub fn extract_link_targets(html: &Html, spec: &SelectorSpec, base_url: &str) -> Vec<String> {
    let mut forced = spec.clone();
    forced.all = true;
    if forced.attr.is_none() {
        forced.attr = Some("href".to_string());
    }

    let (value, _) = apply_spec(html, &forced);
    let hrefs: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(Value::String(s)) => vec![s],
        _ => Vec::new(),
    };

    let mut seen = std::collections::HashSet::new();
    hrefs
        .into_iter()
        .filter_map(|href| resolve_href(base_url, &href))
        .filter(|resolved| seen.insert(resolved.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::schema::{FieldMapping, TypedFieldKind};
    use super::*;

    fn map(entries: Vec<(&str, SelectorSpec)>) -> FieldMap {
        FieldMap::new(
            entries
                .into_iter()
                .map(|(field, spec)| FieldMapping {
                    field: field.to_string(),
                    spec,
                })
                .collect(),
        )
    }

    #[test]
    fn first_match_text_extraction() {
        let html = Html::parse_document("<html><body><h1> Example   Domain </h1><h1>Second</h1></body></html>");
        let extraction = extract_fields(&html, &map(vec![("title", SelectorSpec::css("h1"))]));
        assert_eq!(
            extraction.record.get("title"),
            Some(&Value::String("Example Domain".into()))
        );
        assert_eq!(extraction.extracted_count(), 1);
    }

    #[test]
    fn all_matches_collects_every_node() {
        let html = Html::parse_document(
            "<ul><li class='x'>a</li><li class='x'>b</li><li class='x'>c</li></ul>",
        );
        let spec = SelectorSpec::css("li.x").all_matches();
        let extraction = extract_fields(&html, &map(vec![("items", spec)]));
        assert_eq!(
            extraction.record.get("items"),
            Some(&Value::Array(vec![
                Value::String("a".into()),
                Value::String("b".into()),
                Value::String("c".into())
            ]))
        );
    }

    #[test]
    fn attr_extraction_and_regex_capture_group() {
        let html = Html::parse_document(r#"<a class="buy" href="/item?id=1234&ref=x">Buy</a>"#);
        let mut spec = SelectorSpec::css("a.buy").with_attr("href");
        spec.regex = Some(r"id=(\d+)".to_string());
        let extraction = extract_fields(&html, &map(vec![("item_id", spec)]));
        assert_eq!(
            extraction.record.get("item_id"),
            Some(&Value::String("1234".into()))
        );
    }

    #[test]
    fn regex_without_match_yields_null() {
        let html = Html::parse_document("<p class='p'>no digits here</p>");
        let mut spec = SelectorSpec::css("p.p");
        spec.regex = Some(r"(\d+)".to_string());
        let extraction = extract_fields(&html, &map(vec![("num", spec)]));
        assert_eq!(extraction.record.get("num"), Some(&Value::Null));
        assert_eq!(extraction.extracted_count(), 0);
    }

    #[test]
    fn missing_selector_is_null_with_zero_confidence() {
        let html = Html::parse_document("<html><body><p>hi</p></body></html>");
        let extraction =
            extract_fields(&html, &map(vec![("title", SelectorSpec::css(".product-title"))]));
        assert_eq!(extraction.record.get("title"), Some(&Value::Null));
        assert_eq!(extraction.extracted_count(), 0);
        // Untyped misses are the extraction count's problem, not the
        // confidence floor's
        assert!(extraction.low_confidence_fields().is_empty());
    }

    #[test]
    fn consensus_fills_null_primary() {
        let html = Html::parse_document(
            r#"<html><head>
            <meta property="og:title" content="iPhone 15 Pro" />
            <script type="application/ld+json">{"name":"iPhone 15 Pro"}</script>
            </head><body></body></html>"#,
        );
        let extraction =
            extract_fields(&html, &map(vec![("title", SelectorSpec::css(".product-title"))]));
        let field = &extraction.fields["title"];
        assert_eq!(field.value, Some(Value::String("iPhone 15 Pro".into())));
        assert_eq!(field.consensus_agreeing, 2);
        assert!(field.confidence >= CONFIDENCE_FLOOR);
    }

    #[test]
    fn consensus_does_not_override_primary() {
        let html = Html::parse_document(
            r#"<html><head>
            <meta property="og:title" content="Marketing Title" />
            <script type="application/ld+json">{"name":"Marketing Title"}</script>
            </head><body><h1>Actual Title</h1></body></html>"#,
        );
        let extraction = extract_fields(&html, &map(vec![("title", SelectorSpec::css("h1"))]));
        assert_eq!(
            extraction.record.get("title"),
            Some(&Value::String("Actual Title".into()))
        );
    }

    #[test]
    fn consensus_boosts_agreeing_primary() {
        let html = Html::parse_document(
            r#"<html><head>
            <meta property="og:title" content="iPhone 15 Pro" />
            <script type="application/ld+json">{"headline":"iPhone 15 Pro"}</script>
            </head><body><h1>iPhone 15 Pro</h1></body></html>"#,
        );
        let extraction = extract_fields(&html, &map(vec![("title", SelectorSpec::css("h1"))]));
        let field = &extraction.fields["title"];
        assert_eq!(field.consensus_agreeing, 2);
        assert_eq!(field.confidence, 1.0);
    }

    #[test]
    fn typed_field_confidence_flows_through() {
        let html = Html::parse_document(r#"<span class="tel">call us maybe</span>"#);
        let mut spec = SelectorSpec::css("span.tel");
        spec.kind = Some(TypedFieldKind::Phone);
        let extraction = extract_fields(&html, &map(vec![("phone", spec)]));
        assert_eq!(extraction.record.get("phone"), Some(&Value::Null));
        assert!(extraction.low_confidence_fields().contains(&"phone".to_string()));
    }

    #[test]
    fn link_targets_resolve_and_dedupe() {
        let html = Html::parse_document(
            r#"<h3><a href="item1.html">a</a></h3>
               <h3><a href="item2.html">b</a></h3>
               <h3><a href="item1.html">a again</a></h3>"#,
        );
        let spec = SelectorSpec::css("h3>a").with_attr("href");
        let links =
            extract_link_targets(&html, &spec, "https://example.com/books/science/index.html");
        assert_eq!(
            links,
            vec![
                "https://example.com/books/science/item1.html".to_string(),
                "https://example.com/books/science/item2.html".to_string(),
            ]
        );
    }
}
