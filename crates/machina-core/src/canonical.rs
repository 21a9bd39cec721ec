//! Canonical JSON serialization for deterministic hashing.
//!
//! The journal's tamper-evident property requires that the same logical
//! record always serializes to the same bytes. Canonical form here is an
//! RFC 8785 (JCS) subset:
//!
//! 1. Object keys sorted in lexicographic byte order, recursively
//! 2. Arrays in source order
//! 3. No whitespace between tokens
//! 4. Minimal string escaping (only `"`, `\`, and control characters
//!    U+0000..U+001F; short escapes where defined)
//! 5. Numbers rendered by `serde_json`'s own formatter
//!
//! # Example
//!
//! ```
//! use machina_core::canonical::canonicalize_json;
//!
//! let canonical = canonicalize_json(r#"{ "z": 1, "a": 2 }"#).unwrap();
//! assert_eq!(canonical, r#"{"a":2,"z":1}"#);
//! ```

use std::fmt::Write as _;

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from canonicalization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// The input was not valid JSON.
    #[error("JSON parse error: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },
}

/// Canonicalizes a JSON text.
///
/// # Errors
///
/// Returns [`CanonicalError::Parse`] when the input is not valid JSON.
pub fn canonicalize_json(input: &str) -> Result<String, CanonicalError> {
    let value: Value = serde_json::from_str(input).map_err(|e| CanonicalError::Parse {
        message: e.to_string(),
    })?;
    Ok(canonical_string(&value))
}

/// Canonicalizes a JSON text, returning the input unchanged when it does not
/// parse. Journal payloads are caller-supplied; a malformed payload is still
/// journaled (as an opaque string) rather than dropped.
#[must_use]
pub fn canonicalize_json_lossy(input: &str) -> String {
    canonicalize_json(input).unwrap_or_else(|_| input.to_string())
}

/// Produces the canonical serialization of an already-parsed value.
#[must_use]
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    emit_value(value, &mut out);
    out
}

/// Checks whether the input is already in canonical form.
#[must_use]
pub fn is_canonical(input: &str) -> bool {
    canonicalize_json(input).is_ok_and(|c| c == input)
}

fn emit_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => emit_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_value(item, out);
            }
            out.push(']');
        }
        Value::Object(obj) => emit_object(obj, out),
    }
}

fn emit_object(obj: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = obj.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        emit_string(key, out);
        out.push(':');
        emit_value(&obj[key.as_str()], out);
    }
    out.push('}');
}

// Minimal escaping per RFC 8785 section 3.2.2.2: only `"`, `\`, and
// U+0000..U+001F must be escaped; DEL and C1 controls stay raw.
fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
