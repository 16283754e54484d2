//! Payload filter expressions
//!
//! A configuration may carry an optional filter of the form `path=value`,
//! where `path` is a dot-separated sequence of object keys. Any other
//! syntax is treated as always-match: a broken filter must not silently
//! drop events.

use serde_json::Value;
use tracing::debug;

/// Evaluates a filter expression against an event payload.
///
/// - Empty or absent expression: match.
/// - `path=value`: walk `path` from the payload root; a missing key or a
///   traversal through a non-object yields no match. A string terminal is
///   compared by string equality, anything else by its JSON text.
/// - Anything else: match (fail open).
pub fn matches(expression: Option<&str>, payload: &Value) -> bool {
    let Some(expression) = expression else {
        return true;
    };
    if expression.is_empty() {
        return true;
    }

    let Some((path, expected)) = expression.split_once('=') else {
        debug!(filter = %expression, "Filter has no recognized form, allowing event");
        return true;
    };

    let path = path.trim();
    let expected = expected.trim();

    let mut node = payload;
    for segment in path.split('.') {
        match node.get(segment) {
            Some(next) => node = next,
            None => return false,
        }
    }

    match node {
        Value::String(s) => s == expected,
        other => other.to_string() == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_or_empty_always_matches() {
        let payload = json!({"a": 1});
        assert!(matches(None, &payload));
        assert!(matches(Some(""), &payload));
    }

    #[test]
    fn string_terminal_compares_by_equality() {
        let payload = json!({"customer": {"type": "PREMIUM"}});
        assert!(matches(Some("customer.type=PREMIUM"), &payload));
        assert!(!matches(Some("customer.type=BASIC"), &payload));
    }

    #[test]
    fn non_string_terminal_compares_by_json_text() {
        let payload = json!({"order": {"total": 42, "paid": true}});
        assert!(matches(Some("order.total=42"), &payload));
        assert!(matches(Some("order.paid=true"), &payload));
        assert!(!matches(Some("order.total=43"), &payload));
    }

    #[test]
    fn missing_segment_is_no_match() {
        let payload = json!({"customer": {"type": "PREMIUM"}});
        assert!(!matches(Some("customer.tier=PREMIUM"), &payload));
        assert!(!matches(Some("account.type=PREMIUM"), &payload));
    }

    #[test]
    fn traversal_through_non_object_is_no_match() {
        let payload = json!({"customer": "just-a-string"});
        assert!(!matches(Some("customer.type=PREMIUM"), &payload));

        let payload = json!({"items": [1, 2, 3]});
        assert!(!matches(Some("items.0=1"), &payload));
    }

    #[test]
    fn unrecognized_syntax_fails_open() {
        let payload = json!({"a": 1});
        assert!(matches(Some("customer.type > 5"), &payload));
        assert!(matches(Some("!!garbage!!"), &payload));
    }

    #[test]
    fn whitespace_around_parts_is_trimmed() {
        let payload = json!({"customer": {"type": "PREMIUM"}});
        assert!(matches(Some("customer.type = PREMIUM"), &payload));
    }
}
