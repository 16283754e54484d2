//! Restricted glob matching
//!
//! Event-type and path patterns support a single wildcard: `*` matches any
//! run of characters, including the empty run. Every other character is a
//! literal. No brace, range, or `**` constructs.

use regex::Regex;

/// Compiles a glob into an anchored regex. Non-wildcard segments are
/// escaped so regex metacharacters in patterns stay literal.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for (i, segment) in pattern.split('*').enumerate() {
        if i > 0 {
            expr.push_str(".*");
        }
        expr.push_str(&regex::escape(segment));
    }
    expr.push('$');
    Regex::new(&expr).ok()
}

fn glob_match(pattern: &str, value: &str) -> bool {
    match glob_to_regex(pattern) {
        Some(re) => re.is_match(value),
        None => false,
    }
}

/// Case-sensitive event-type match.
pub fn matches_event_type(pattern: &str, event_type: &str) -> bool {
    glob_match(pattern, event_type)
}

/// Case-sensitive URL-path match.
pub fn matches_path(pattern: &str, path: &str) -> bool {
    glob_match(pattern, path)
}

/// True when any pattern matches, or when the list is empty (accept-all).
pub fn matches_any(patterns: &[String], event_type: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| matches_event_type(p, event_type))
}
