//! Input patch safety: the reserved-prefix merge filter.
//!
//! A selector may attach an input patch to its pick. The patch merges into
//! the run inputs by shallow object merge, but keys with reserved prefixes
//! (`_system`, `_queue`, `_meta`) are dropped so an external policy can
//! never forge loop-internal or queue-internal state. The filter is
//! asymmetric on purpose: the step loop itself injects `_system_*` keys
//! (compile-error feedback) by plain merge, bypassing this function.

/// Prefixes an external patch may never set.
pub const RESERVED_PREFIXES: &[&str] = &["_system", "_queue", "_meta"];

/// Shallow-merges `patch_json` into `base_json`, dropping reserved-prefix
/// keys and (when `allowed_keys` is non-empty) keys outside the whitelist.
///
/// A patch that is not a JSON object is discarded entirely; a base that is
/// not an object is replaced by an empty one before merging. Returns the
/// merged inputs.
#[must_use]
pub fn safe_merge_patch(base_json: &str, patch_json: &str, allowed_keys: &[String]) -> String {
    let mut base = match serde_json::from_str::<serde_json::Value>(base_json) {
        Ok(v @ serde_json::Value::Object(_)) => v,
        _ => serde_json::Value::Object(serde_json::Map::new()),
    };

    let Ok(serde_json::Value::Object(patch)) = serde_json::from_str::<serde_json::Value>(patch_json)
    else {
        return base.to_string();
    };

    let mut blocked = 0usize;
    if let Some(obj) = base.as_object_mut() {
        for (key, value) in patch {
            if RESERVED_PREFIXES.iter().any(|p| key.starts_with(p)) {
                blocked += 1;
                continue;
            }
            if !allowed_keys.is_empty() && !allowed_keys.contains(&key) {
                blocked += 1;
                continue;
            }
            obj.insert(key, value);
        }
    }
    if blocked > 0 {
        tracing::debug!(blocked, "input patch keys dropped by merge filter");
    }
    base.to_string()
}

/// Plain shallow merge without filtering. Loop-internal use only (the
/// compile-error feedback path); external patches go through
/// [`safe_merge_patch`].
#[must_use]
pub fn merge_unchecked(base_json: &str, patch_json: &str) -> String {
    let mut base = match serde_json::from_str::<serde_json::Value>(base_json) {
        Ok(v @ serde_json::Value::Object(_)) => v,
        _ => serde_json::Value::Object(serde_json::Map::new()),
    };
    if let Ok(serde_json::Value::Object(patch)) = serde_json::from_str(patch_json) {
        if let Some(obj) = base.as_object_mut() {
            for (key, value) in patch {
                obj.insert(key, value);
            }
        }
    }
    base.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> serde_json::Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn merges_and_overrides() {
        let merged = safe_merge_patch(r#"{"a":1,"b":2}"#, r#"{"b":3,"c":4}"#, &[]);
        let v = parse(&merged);
        assert_eq!(v["a"], 1);
        assert_eq!(v["b"], 3);
        assert_eq!(v["c"], 4);
    }

    #[test]
    fn reserved_prefixes_are_dropped() {
        let merged = safe_merge_patch(
            r#"{"a":1}"#,
            r#"{"_system_compile_error":"x","_queue":{"attempt":99},"_meta_x":1,"ok":2}"#,
            &[],
        );
        let v = parse(&merged);
        assert_eq!(v["ok"], 2);
        assert!(v["_system_compile_error"].is_null());
        assert!(v["_queue"].is_null());
        assert!(v["_meta_x"].is_null());
    }

    #[test]
    fn whitelist_restricts_when_present() {
        let merged = safe_merge_patch(
            r#"{}"#,
            r#"{"max_rows":5,"pattern":"x","other":1}"#,
            &["max_rows".to_string(), "pattern".to_string()],
        );
        let v = parse(&merged);
        assert_eq!(v["max_rows"], 5);
        assert_eq!(v["pattern"], "x");
        assert!(v["other"].is_null());
    }

    #[test]
    fn non_object_patch_is_discarded() {
        assert_eq!(parse(&safe_merge_patch(r#"{"a":1}"#, "[1,2]", &[]))["a"], 1);
        assert_eq!(parse(&safe_merge_patch(r#"{"a":1}"#, "not json", &[]))["a"], 1);
        assert_eq!(parse(&safe_merge_patch(r#"{"a":1}"#, r#""str""#, &[]))["a"], 1);
    }

    #[test]
    fn non_object_base_becomes_empty_object() {
        let merged = safe_merge_patch("null", r#"{"a":1}"#, &[]);
        assert_eq!(parse(&merged)["a"], 1);
    }

    #[test]
    fn unchecked_merge_passes_reserved_keys() {
        let merged = merge_unchecked(r#"{"a":1}"#, r#"{"_system_compile_error":{"output":"e"}}"#);
        let v = parse(&merged);
        assert_eq!(v["_system_compile_error"]["output"], "e");
    }
}
