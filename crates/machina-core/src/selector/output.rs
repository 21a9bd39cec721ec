//! The selector output wire format.
//!
//! A selector (in particular an external policy process) communicates its
//! decision as a UTF-8 text blob in one of five shapes:
//!
//! ```text
//! <PICK><SID0007><END>
//! <PICK><SID0007><INP>{json object}</INP><END>
//! <PICK><SID0007><INP64>base64(json object)</INP64><END>
//! <ASK_SUP><END>
//! <NOOP><END>
//! ```
//!
//! Parsing is strict: anything else is `INVALID`. The INP/INP64 payload must
//! itself parse as a JSON object. [`format_selection`] and
//! [`parse_selector_output`] round-trip.

use base64::Engine as _;

use super::{Selection, SelectionKind};
use crate::types::Sid;

const PICK_PREFIX: &str = "<PICK><";
const END: &str = "<END>";
const INP_OPEN: &str = "<INP>";
const INP_CLOSE: &str = "</INP>";
const INP64_OPEN: &str = "<INP64>";
const INP64_CLOSE: &str = "</INP64>";

/// Parses a selector output blob.
#[must_use]
pub fn parse_selector_output(s: &str) -> Selection {
    let raw = s.to_string();
    let t = s.trim();

    if t == "<ASK_SUP><END>" {
        return Selection {
            kind: SelectionKind::AskSup,
            raw,
        };
    }
    if t == "<NOOP><END>" {
        return Selection {
            kind: SelectionKind::Noop,
            raw,
        };
    }

    let Some(rest) = t.strip_prefix(PICK_PREFIX) else {
        return Selection {
            kind: SelectionKind::Invalid,
            raw,
        };
    };
    let invalid = || Selection {
        kind: SelectionKind::Invalid,
        raw: raw.clone(),
    };

    let Some(sid_end) = rest.find('>') else {
        return invalid();
    };
    let Some(sid) = Sid::parse(&rest[..sid_end]) else {
        return invalid();
    };
    if !t.ends_with(END) {
        return invalid();
    }

    let input_patch = if let Some(open) = t.find(INP64_OPEN) {
        let after = &t[open + INP64_OPEN.len()..];
        let Some(close) = after.find(INP64_CLOSE) else {
            return invalid();
        };
        let compact: String = after[..close]
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(compact) else {
            return invalid();
        };
        let Ok(text) = String::from_utf8(decoded) else {
            return invalid();
        };
        Some(text)
    } else if let Some(open) = t.find(INP_OPEN) {
        let after = &t[open + INP_OPEN.len()..];
        let Some(close) = after.find(INP_CLOSE) else {
            return invalid();
        };
        Some(after[..close].to_string())
    } else {
        None
    };

    // The patch must be a JSON object or the whole output is invalid.
    if let Some(patch) = &input_patch {
        match serde_json::from_str::<serde_json::Value>(patch) {
            Ok(serde_json::Value::Object(_)) => {}
            _ => return invalid(),
        }
    }

    Selection {
        kind: SelectionKind::Pick { sid, input_patch },
        raw,
    }
}

/// Renders a selection kind in wire form. `Invalid` has no wire form and
/// renders as an empty string (which parses back to `Invalid`).
#[must_use]
pub fn format_selection(kind: &SelectionKind) -> String {
    match kind {
        SelectionKind::Pick {
            sid,
            input_patch: None,
        } => format!("<PICK><{}>{END}", sid.to_wire()),
        SelectionKind::Pick {
            sid,
            input_patch: Some(patch),
        } => format!("<PICK><{}>{INP_OPEN}{patch}{INP_CLOSE}{END}", sid.to_wire()),
        SelectionKind::AskSup => "<ASK_SUP><END>".to_string(),
        SelectionKind::Noop => "<NOOP><END>".to_string(),
        SelectionKind::Invalid => String::new(),
    }
}

/// Shorthand: a bare pick in wire form.
#[must_use]
pub fn pick_wire(sid: Sid) -> String {
    format_selection(&SelectionKind::Pick {
        sid,
        input_patch: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn parses_bare_forms() {
        assert_eq!(
            parse_selector_output("<NOOP><END>").kind,
            SelectionKind::Noop
        );
        assert_eq!(
            parse_selector_output("<ASK_SUP><END>").kind,
            SelectionKind::AskSup
        );
        assert_eq!(
            parse_selector_output("  <NOOP><END>\n").kind,
            SelectionKind::Noop
        );
    }

    #[test]
    fn parses_pick() {
        let sel = parse_selector_output("<PICK><SID0007><END>");
        assert_eq!(
            sel.kind,
            SelectionKind::Pick {
                sid: Sid(7),
                input_patch: None
            }
        );
    }

    #[test]
    fn parses_pick_with_inline_patch() {
        let sel = parse_selector_output(r#"<PICK><SID0002><INP>{"max_rows": 10}</INP><END>"#);
        match sel.kind {
            SelectionKind::Pick {
                sid,
                input_patch: Some(patch),
            } => {
                assert_eq!(sid, Sid(2));
                assert_eq!(patch, r#"{"max_rows": 10}"#);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_pick_with_base64_patch() {
        let patch = r#"{"pattern":"WARN"}"#;
        let b64 = base64::engine::general_purpose::STANDARD.encode(patch);
        let sel = parse_selector_output(&format!("<PICK><SID0001><INP64>{b64}</INP64><END>"));
        match sel.kind {
            SelectionKind::Pick {
                input_patch: Some(p),
                ..
            } => assert_eq!(p, patch),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn strict_parsing_rejects_garbage() {
        for bad in [
            "",
            "<GARBAGE>",
            "<PICK><END>",
            "<PICK><SID12><END>",
            "<PICK><SID0001>",                                // missing END
            "<PICK><SID0001><INP>{</INP><END>",               // patch not JSON
            "<PICK><SID0001><INP>[1,2]</INP><END>",           // patch not object
            "<PICK><SID0001><INP>{\"a\":1}<END>",             // unterminated INP
            "<PICK><SID0001><INP64>!!!</INP64><END>",         // bad base64
            "<NOOP>",
            "noop",
        ] {
            assert_eq!(
                parse_selector_output(bad).kind,
                SelectionKind::Invalid,
                "should reject {bad:?}"
            );
        }
    }

    #[test]
    fn format_parse_round_trip() {
        let cases = vec![
            SelectionKind::Noop,
            SelectionKind::AskSup,
            SelectionKind::Pick {
                sid: Sid(1),
                input_patch: None,
            },
            SelectionKind::Pick {
                sid: Sid(9999),
                input_patch: Some(r#"{"k":"v","n":3}"#.to_string()),
            },
        ];
        for kind in cases {
            let wire = format_selection(&kind);
            assert_eq!(parse_selector_output(&wire).kind, kind, "wire {wire:?}");
        }
    }

    #[test]
    fn raw_is_preserved_verbatim() {
        let sel = parse_selector_output("<GARBAGE>");
        assert_eq!(sel.raw, "<GARBAGE>");
    }
}
