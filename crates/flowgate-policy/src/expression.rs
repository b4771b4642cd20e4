use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,
    #[error("unparseable clause: {0}")]
    Unparseable(String),
    #[error("invalid regex {pattern}: {message}")]
    InvalidRegex { pattern: String, message: String },
}

/// Evaluate a policy expression against request context data.
///
/// Supported clauses:
/// - `key == "value"`: exact match
/// - `key != "value"`: present and different
/// - `key contains "substr"`: substring match
/// - `key matches "regex"`: regex match
/// - `key exists`: key is present and not null
/// - `true` / `false`
///
/// Clauses may be prefixed with `not` and combined with `and` / `or`
/// (`and` binds tighter). Keywords inside quoted values are ignored.
///
/// Non-string values are compared through their JSON text, so a boolean
/// `true` matches `"true"`.
pub fn evaluate_expression(
    expr: &str,
    context: &HashMap<String, serde_json::Value>,
) -> Result<bool, ExpressionError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ExpressionError::Empty);
    }

    for disjunct in split_outside_quotes(expr, " or ") {
        let mut all = true;
        for conjunct in split_outside_quotes(disjunct, " and ") {
            if !evaluate_clause(conjunct, context)? {
                all = false;
                break;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}

fn evaluate_clause(
    clause: &str,
    context: &HashMap<String, serde_json::Value>,
) -> Result<bool, ExpressionError> {
    let clause = clause.trim();

    if let Some(rest) = clause.strip_prefix("not ") {
        return evaluate_clause(rest, context).map(|b| !b);
    }

    match clause {
        "true" => return Ok(true),
        "false" => return Ok(false),
        _ => {}
    }

    // key exists
    if let Some(key) = clause.strip_suffix(" exists") {
        return Ok(context
            .get(key.trim())
            .is_some_and(|v| !v.is_null()));
    }

    // key matches "regex"
    if let Some((key, pattern)) = parse_operator(clause, " matches ") {
        let re = regex::Regex::new(pattern).map_err(|e| ExpressionError::InvalidRegex {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        return Ok(lookup_text(context, key).is_some_and(|s| re.is_match(&s)));
    }

    // key contains "value"
    if let Some((key, substr)) = parse_operator(clause, " contains ") {
        return Ok(lookup_text(context, key).is_some_and(|s| s.contains(substr)));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(clause, "!=") {
        return Ok(lookup_text(context, key).is_some_and(|s| s != value));
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(clause, "==") {
        return Ok(lookup_text(context, key).is_some_and(|s| s == value));
    }

    Err(ExpressionError::Unparseable(clause.to_string()))
}

/// Textual form of a context value; `None` for missing or null keys.
fn lookup_text(context: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    match context.get(key)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let parts: Vec<&str> = expr.splitn(2, op).collect();
    if parts.len() != 2 {
        return None;
    }
    let key = parts[0].trim();
    if key.is_empty() || key.contains('"') {
        return None;
    }
    let val = parts[1].trim().trim_matches('"');
    Some((key, val))
}

/// Split on `sep`, ignoring occurrences inside double quotes.
fn split_outside_quotes<'a>(input: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    let mut i = 0;
    let bytes = input.as_bytes();

    while i < bytes.len() {
        if bytes[i] == b'"' {
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if !in_quotes && bytes[i..].starts_with(sep.as_bytes()) {
            parts.push(&input[start..i]);
            i += sep.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(&input[start..]);
    parts
}
