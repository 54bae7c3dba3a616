//! Multi-source consensus channels for confidence amplification.
//!
//! Besides the primary CSS selector, every engine probes three secondary
//! evidence channels: JSON-LD blocks, OpenGraph/Twitter meta tags, and
//! embedded script data blobs (Next.js hydration payloads and plain
//! `application/json` scripts). Two agreeing channels add +0.2 to a
//! field's confidence, three add +0.3. Consensus never overrides the
//! primary selector's value unless the primary yielded null.

use std::collections::HashMap;

use scraper::{Html, Selector};
use serde_json::Value;

use super::typed::collapse_whitespace;

/// Max depth for recursive key search inside JSON payloads. Hydration
/// payloads nest deeply but field data lives near the top.
const JSON_SEARCH_DEPTH: usize = 8;

/// Per-field aliases in the secondary channels. The first column is the
/// normalized field name; meta keys match `property`/`name` attributes,
/// JSON keys match during recursive traversal.
const FIELD_ALIASES: &[(&str, &[&str], &[&str])] = &[
    (
        "title",
        &["og:title", "twitter:title"],
        &["headline", "name", "title"],
    ),
    (
        "description",
        &["og:description", "twitter:description", "description"],
        &["description"],
    ),
    (
        "image",
        &["og:image", "twitter:image"],
        &["image", "thumbnailUrl"],
    ),
    ("url", &["og:url"], &["url"]),
    (
        "price",
        &["product:price:amount", "og:price:amount"],
        &["price", "lowPrice"],
    ),
    ("author", &["article:author", "twitter:creator"], &["author"]),
];

/// Everything the secondary channels saw on one page, gathered once and
/// queried per field.
#[derive(Debug, Default)]
pub struct ConsensusSources {
    jsonld: Vec<Value>,
    meta: HashMap<String, String>,
    embedded: Vec<Value>,
}

/// A field's candidate values, one slot per channel.
#[derive(Debug, Default, Clone)]
pub struct ChannelCandidates {
    pub jsonld: Option<String>,
    pub meta: Option<String>,
    pub embedded: Option<String>,
}

/// Consensus verdict for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    /// Value the agreeing channels converged on, if any
    pub agreed_value: Option<String>,
    /// Number of channels in agreement (0, 2, or 3; a single channel is
    /// not agreement)
    pub agreeing: u8,
    /// Confidence bonus: 0.2 for two channels, 0.3 for three
    pub bonus: f64,
}

impl ConsensusSources {
    /// Parse all secondary channels out of a document.
    #[must_use]
    pub fn gather(html: &Html) -> Self {
        let mut sources = Self::default();

        if let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) {
            for el in html.select(&sel) {
                let text: String = el.text().collect();
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    // JSON-LD roots may be arrays or @graph wrappers
                    match value {
                        Value::Array(items) => sources.jsonld.extend(items),
                        Value::Object(ref obj) if obj.contains_key("@graph") => {
                            if let Some(Value::Array(items)) = obj.get("@graph") {
                                sources.jsonld.extend(items.iter().cloned());
                            }
                            sources.jsonld.push(value);
                        }
                        other => sources.jsonld.push(other),
                    }
                }
            }
        }

        if let Ok(sel) = Selector::parse("meta[property][content], meta[name][content]") {
            for el in html.select(&sel) {
                let key = el
                    .value()
                    .attr("property")
                    .or_else(|| el.value().attr("name"));
                if let (Some(key), Some(content)) = (key, el.value().attr("content")) {
                    sources
                        .meta
                        .entry(key.to_lowercase())
                        .or_insert_with(|| content.to_string());
                }
            }
        }

        if let Ok(sel) =
            Selector::parse(r#"script#__NEXT_DATA__, script[type="application/json"]"#)
        {
            for el in html.select(&sel) {
                let text: String = el.text().collect();
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    sources.embedded.push(value);
                }
            }
        }

        sources
    }

    /// Whether any secondary channel produced data at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jsonld.is_empty() && self.meta.is_empty() && self.embedded.is_empty()
    }

    /// Candidate values for a field, one per channel.
    #[must_use]
    pub fn candidates_for(&self, field: &str) -> ChannelCandidates {
        let normalized = normalize_field_name(field);
        let (meta_keys, json_keys) = alias_keys(&normalized, field);

        let meta = meta_keys
            .iter()
            .find_map(|k| self.meta.get(*k).cloned())
            .map(|v| collapse_whitespace(&v));

        let jsonld = self
            .jsonld
            .iter()
            .find_map(|v| json_keys.iter().find_map(|k| find_key(v, k, 0)));

        let embedded = self
            .embedded
            .iter()
            .find_map(|v| json_keys.iter().find_map(|k| find_key(v, k, 0)));

        ChannelCandidates {
            jsonld,
            meta,
            embedded,
        }
    }
}

/// Tally agreement among the channel candidates.
#[must_use]
pub fn evaluate(candidates: &ChannelCandidates) -> Consensus {
    let present: Vec<&String> = [&candidates.jsonld, &candidates.meta, &candidates.embedded]
        .into_iter()
        .flatten()
        .collect();

    let mut best: Option<(&String, u8)> = None;
    for value in &present {
        let count = present
            .iter()
            .filter(|other| values_agree(value, other))
            .count() as u8;
        if count > best.map_or(0, |(_, c)| c) {
            best = Some((value, count));
        }
    }

    match best {
        Some((value, agreeing)) if agreeing >= 2 => Consensus {
            agreed_value: Some((*value).clone()),
            agreeing,
            bonus: if agreeing >= 3 { 0.3 } else { 0.2 },
        },
        Some((value, _)) => Consensus {
            // A lone channel is evidence for fallback but earns no bonus
            agreed_value: Some((*value).clone()),
            agreeing: 1,
            bonus: 0.0,
        },
        None => Consensus {
            agreed_value: None,
            agreeing: 0,
            bonus: 0.0,
        },
    }
}

fn values_agree(a: &str, b: &str) -> bool {
    collapse_whitespace(a).to_lowercase() == collapse_whitespace(b).to_lowercase()
}

fn normalize_field_name(field: &str) -> String {
    field
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

fn alias_keys<'a>(normalized: &str, raw: &'a str) -> (Vec<&'a str>, Vec<&'a str>) {
    for (name, meta_keys, json_keys) in FIELD_ALIASES {
        if *name == normalized {
            return (meta_keys.to_vec(), json_keys.to_vec());
        }
    }
    // Unknown fields fall back to exact-name probing in every channel
    (vec![raw], vec![raw])
}

/// Depth-first search for the first scalar under `key`.
fn find_key(value: &Value, key: &str, depth: usize) -> Option<String> {
    if depth > JSON_SEARCH_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key) {
                if let Some(s) = scalar_to_string(found) {
                    return Some(s);
                }
                // e.g. author: {"@type": "Person", "name": "..."}
                if let Some(s) = find_key(found, "name", depth + 1) {
                    return Some(s);
                }
            }
            map.values().find_map(|v| find_key(v, key, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key, depth + 1)),
        _ => None,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let collapsed = collapse_whitespace(s);
            (!collapsed.is_empty()).then_some(collapsed)
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head>
        <meta property="og:title" content="iPhone 15 Pro" />
        <meta name="description" content="A phone." />
        <script type="application/ld+json">
            {"@type":"Product","name":"iPhone 15 Pro","offers":{"price":"999"}}
        </script>
        <script id="__NEXT_DATA__" type="application/json">
            {"props":{"pageProps":{"product":{"title":"iPhone 15 Pro","price":999}}}}
        </script>
        </head><body><h1>something else</h1></body></html>
    "#;

    #[test]
    fn three_channels_agree_on_title() {
        let html = Html::parse_document(PAGE);
        let sources = ConsensusSources::gather(&html);
        let candidates = sources.candidates_for("title");
        let consensus = evaluate(&candidates);
        assert_eq!(consensus.agreeing, 3);
        assert_eq!(consensus.bonus, 0.3);
        assert_eq!(consensus.agreed_value.as_deref(), Some("iPhone 15 Pro"));
    }

    #[test]
    fn price_agrees_across_jsonld_and_embedded() {
        let html = Html::parse_document(PAGE);
        let sources = ConsensusSources::gather(&html);
        let candidates = sources.candidates_for("price");
        let consensus = evaluate(&candidates);
        assert_eq!(consensus.agreeing, 2);
        assert_eq!(consensus.bonus, 0.2);
        assert_eq!(consensus.agreed_value.as_deref(), Some("999"));
    }

    #[test]
    fn single_channel_earns_no_bonus() {
        let html = Html::parse_document(
            r#"<html><head><meta property="og:title" content="Lonely" /></head></html>"#,
        );
        let sources = ConsensusSources::gather(&html);
        let consensus = evaluate(&sources.candidates_for("title"));
        assert_eq!(consensus.agreeing, 1);
        assert_eq!(consensus.bonus, 0.0);
    }

    #[test]
    fn unknown_field_yields_nothing() {
        let html = Html::parse_document(PAGE);
        let sources = ConsensusSources::gather(&html);
        let consensus = evaluate(&sources.candidates_for("sku_number"));
        assert_eq!(consensus.agreeing, 0);
        assert!(consensus.agreed_value.is_none());
    }
}
