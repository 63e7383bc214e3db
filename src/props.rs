//! Validate mock data before it is injected into a preview.
//!
//! Rejects prototype-pollution keys, event-handler-like keys, embedded script
//! markers and script-bearing URIs. Accepted data is re-encoded with sorted
//! keys so the same payload always produces the same document.

use crate::error::PreviewError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Maximum recursion depth for nested objects/arrays
const MAX_DEPTH: usize = 32;

/// Keys that could be used for prototype pollution
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Lowercase DOM handler names; camel-cased `onX` keys are caught by prefix
const HANDLER_KEYS: &[&str] = &[
    "onabort", "onblur", "onchange", "onclick", "ondblclick", "onerror", "onfocus", "oninput",
    "onkeydown", "onkeypress", "onkeyup", "onload", "onmessage", "onmousedown", "onmouseenter",
    "onmouseleave", "onmousemove", "onmouseout", "onmouseover", "onmouseup", "onpointerdown",
    "onpointerup", "onreset", "onresize", "onscroll", "onsubmit", "ontoggle", "onunload",
];

/// URI schemes that execute when followed
const SCRIPT_SCHEMES: &[&str] = &["javascript", "vbscript"];

static SCRIPT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*/?\s*script\b|<[^>]*\son[a-z]+\s*=").expect("marker pattern must compile")
});

/// Mock data that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct MockData(Value);

impl Default for MockData {
    fn default() -> Self {
        Self(Value::Object(Map::new()))
    }
}

impl MockData {
    /// Validate and canonicalize a JSON value.
    ///
    /// # Errors
    /// Returns `InvalidMockData` if:
    /// - A dangerous key (`__proto__`, `constructor`, `prototype`) is found
    /// - An event-handler-like key (`onClick`, `onerror`) is found
    /// - A string carries a script tag, inline handler or `javascript:` URI
    /// - Nesting depth exceeds MAX_DEPTH (32)
    pub fn new(value: Value) -> Result<Self, PreviewError> {
        sanitize_recursive(value, 0).map(Self)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, PreviewError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| PreviewError::InvalidMockData(format!("not valid JSON: {}", e)))?;
        Self::new(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Canonical JSON text: compact, keys sorted.
    pub fn to_canonical_json(&self) -> String {
        // Serializing a Value cannot fail: keys are always strings
        serde_json::to_string(&self.0).unwrap_or_else(|_| "null".to_string())
    }

    /// Canonical JSON safe to place inside an HTML `<script>` block.
    pub fn to_embedded_json(&self) -> String {
        embed_json(&self.to_canonical_json())
    }
}

/// Escape JSON text for an HTML `<script>` block. The escaped characters
/// only ever occur inside JSON strings, so the result decodes identically.
pub(crate) fn embed_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        match ch {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(ch),
        }
    }
    out
}

fn sanitize_recursive(value: Value, depth: usize) -> Result<Value, PreviewError> {
    if depth > MAX_DEPTH {
        return Err(PreviewError::InvalidMockData(format!(
            "nesting too deep (max {} levels)",
            MAX_DEPTH
        )));
    }

    match value {
        Value::Object(map) => {
            for key in map.keys() {
                check_key(key)?;
            }

            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut sanitized = Map::new();
            for (key, val) in entries {
                let val = sanitize_recursive(val, depth + 1)?;
                sanitized.insert(key, val);
            }
            Ok(Value::Object(sanitized))
        }
        Value::Array(arr) => {
            let sanitized: Result<Vec<Value>, PreviewError> = arr
                .into_iter()
                .map(|v| sanitize_recursive(v, depth + 1))
                .collect();
            Ok(Value::Array(sanitized?))
        }
        Value::String(s) => {
            check_string(&s)?;
            Ok(Value::String(s))
        }
        // Numbers, booleans and null are safe
        other => Ok(other),
    }
}

fn check_key(key: &str) -> Result<(), PreviewError> {
    if DANGEROUS_KEYS.contains(&key) {
        return Err(PreviewError::InvalidMockData(format!(
            "prototype pollution attempt: '{}' key is forbidden",
            key
        )));
    }
    if is_handler_key(key) {
        return Err(PreviewError::InvalidMockData(format!(
            "event handler key '{}' is forbidden",
            key
        )));
    }
    Ok(())
}

fn is_handler_key(key: &str) -> bool {
    let camel = key.len() > 2
        && key.starts_with("on")
        && key[2..].chars().next().is_some_and(|c| c.is_ascii_uppercase());
    camel || HANDLER_KEYS.contains(&key.to_ascii_lowercase().as_str())
}

fn check_string(s: &str) -> Result<(), PreviewError> {
    if SCRIPT_MARKER.is_match(s) {
        return Err(PreviewError::InvalidMockData(
            "string values must not embed script tags or inline handlers".to_string(),
        ));
    }
    if is_script_uri(s) {
        return Err(PreviewError::InvalidMockData(format!(
            "script URI is forbidden: {}",
            s.chars().take(40).collect::<String>()
        )));
    }
    Ok(())
}

fn is_script_uri(s: &str) -> bool {
    if !s.contains(':') {
        return false;
    }
    // The URL parser drops the tabs/newlines/control chars browsers also ignore
    match url::Url::parse(s) {
        Ok(parsed) => {
            SCRIPT_SCHEMES.contains(&parsed.scheme())
                || (parsed.scheme() == "data" && parsed.path().to_ascii_lowercase().starts_with("text/html"))
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rejected(value: Value) -> String {
        MockData::new(value).unwrap_err().to_string()
    }

    #[test]
    fn test_safe_props() {
        let props = json!({
            "page": "home",
            "user": {
                "name": "Alice",
                "online": true,
                "settings": {
                    "theme": "dark"
                }
            },
            "items": [1, 2, {"nested": true}],
            "homepage": "https://example.com/a?b=1&c=<2>"
        });

        let data = MockData::new(props.clone()).unwrap();
        assert_eq!(data.value(), &props);
    }

    #[test]
    fn test_blocks_proto() {
        let err = rejected(json!({"__proto__": {"polluted": true}}));
        assert!(err.contains("__proto__"));
    }

    #[test]
    fn test_blocks_nested_constructor_in_array() {
        let err = rejected(json!({"items": [{"safe": true}, {"constructor": {}}]}));
        assert!(err.contains("constructor"));
    }

    #[test]
    fn test_blocks_handler_keys() {
        assert!(rejected(json!({"onClick": "x"})).contains("onClick"));
        assert!(rejected(json!({"props": {"onerror": "x"}})).contains("onerror"));
    }

    #[test]
    fn test_blocks_script_markers() {
        assert!(rejected(json!({"bio": "<script>alert(1)</script>"})).contains("script"));
        assert!(rejected(json!({"bio": "<img src=x onerror=alert(1)>"})).contains("inline handlers"));
    }

    #[test]
    fn test_blocks_script_uris() {
        assert!(rejected(json!({"href": "javascript:alert(1)"})).contains("script URI"));
        assert!(rejected(json!({"href": "  JavaScript:alert(1)"})).contains("script URI"));
        assert!(rejected(json!({"href": "java\tscript:alert(1)"})).contains("script URI"));
        assert!(rejected(json!({"href": "data:text/html,<b>x</b>"})).contains("script URI"));
        assert!(MockData::new(json!({"href": "data:image/png;base64,AAAA"})).is_ok());
        assert!(MockData::new(json!({"note": "Note: bring snacks"})).is_ok());
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!({"leaf": true});
        for _ in 0..35 {
            value = json!({"nested": value});
        }

        assert!(rejected(value).contains("too deep"));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let data = MockData::from_json_str(r#"{"b": 1, "a": {"d": 2, "c": 3}}"#).unwrap();
        assert_eq!(data.to_canonical_json(), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_embedded_json_escapes_markup() {
        let data = MockData::new(json!({"q": "a < b && c > d \u{2028}"})).unwrap();
        let embedded = data.to_embedded_json();
        assert!(!embedded.contains('<'));
        assert!(!embedded.contains('>'));
        assert!(!embedded.contains('&'));
        assert!(embedded.contains("\\u2028"));

        let decoded: Value = serde_json::from_str(&embedded).unwrap();
        assert_eq!(&decoded, data.value());
    }

    #[test]
    fn test_invalid_json_text() {
        let err = MockData::from_json_str("{not json").unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }
}
