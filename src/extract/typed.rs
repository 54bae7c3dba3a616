//! Typed-field classification: parse, normalize, score.
//!
//! Each classifier returns the normalized value plus a confidence in
//! [0.0, 1.0]. Required fields whose confidence lands under 0.75
//! participate in the pause-decision logic downstream.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::schema::TypedFieldKind;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}\b").expect("email regex")
});

static STREET_HINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(street|st\.?|avenue|ave\.?|road|rd\.?|boulevard|blvd\.?|lane|ln\.?|drive|dr\.?|court|ct\.?|suite|ste\.?|floor|unit|apt\.?)\b",
    )
    .expect("street hint regex")
});

/// Outcome of running a typed classifier over a raw extracted string.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub value: Option<Value>,
    pub confidence: f64,
}

impl TypedValue {
    fn miss() -> Self {
        Self {
            value: None,
            confidence: 0.0,
        }
    }
}

/// Classify `raw` as `kind`, normalizing on the way through.
#[must_use]
pub fn classify(raw: &str, kind: TypedFieldKind) -> TypedValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return TypedValue::miss();
    }
    match kind {
        TypedFieldKind::Email => classify_email(trimmed),
        TypedFieldKind::Phone => classify_phone(trimmed),
        TypedFieldKind::Integer => classify_integer(trimmed),
        TypedFieldKind::Address => classify_address(trimmed),
    }
}

fn classify_email(raw: &str) -> TypedValue {
    match EMAIL_RE.find(raw) {
        Some(m) => {
            let exact = m.as_str().len() == raw.len();
            TypedValue {
                value: Some(Value::String(m.as_str().to_lowercase())),
                confidence: if exact { 0.98 } else { 0.85 },
            }
        }
        None => TypedValue::miss(),
    }
}

fn classify_phone(raw: &str) -> TypedValue {
    let has_plus = raw.trim_start().starts_with('+');
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    // NANP numbers are 10 digits (11 with country code); international
    // numbers run up to 15 per E.164.
    let confidence = match digits.len() {
        10 => 0.95,
        11 if digits.starts_with('1') || has_plus => 0.9,
        7..=9 => 0.6,
        12..=15 if has_plus => 0.85,
        _ => return TypedValue::miss(),
    };

    let normalized = if has_plus {
        format!("+{digits}")
    } else if digits.len() == 10 {
        format!("+1{digits}")
    } else {
        digits
    };

    TypedValue {
        value: Some(Value::String(normalized)),
        confidence,
    }
}

fn classify_integer(raw: &str) -> TypedValue {
    // Clean parse first, then a permissive pass stripping grouping noise
    if let Ok(n) = raw.parse::<i64>() {
        return TypedValue {
            value: Some(Value::from(n)),
            confidence: 1.0,
        };
    }

    let negative = raw.trim_start().starts_with('-');
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() || digits.len() > 18 {
        return TypedValue::miss();
    }
    match digits.parse::<i64>() {
        Ok(n) => TypedValue {
            value: Some(Value::from(if negative { -n } else { n })),
            confidence: 0.8,
        },
        Err(_) => TypedValue::miss(),
    }
}

fn classify_address(raw: &str) -> TypedValue {
    let has_number = raw.chars().any(|c| c.is_ascii_digit());
    let has_street_hint = STREET_HINT_RE.is_match(raw);
    let word_count = raw.split_whitespace().count();

    let confidence = match (has_number, has_street_hint) {
        (true, true) => 0.9,
        (true, false) if word_count >= 3 => 0.65,
        (false, true) => 0.6,
        _ => 0.4,
    };

    TypedValue {
        value: Some(Value::String(collapse_whitespace(raw))),
        confidence,
    }
}

/// Collapse runs of whitespace to single spaces and trim.
#[must_use]
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
