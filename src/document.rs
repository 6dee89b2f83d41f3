//! Helpers for working with generic JSON documents.
//!
//! Build documents, step results and repository settings are all key-value
//! trees. Pipeline phases contribute partial results to the same tree, so
//! merging has to compose without clobbering unrelated fields.

use serde_json::{Map, Value as JsonValue};

/// Marker key: when present (and `true`) in an object being merged, the
/// target entry is replaced instead of merged into.
pub const REPLACE_MARKER: &str = "__REPLACE__";

/// Marker key: asks the pre-/post-index steps to publish their result as
/// index metadata.
pub const READY_MARKER: &str = "__READY__";

/// Deep-merge `source` into `target`.
///
/// Conflict policy, applied key by key:
/// - object into object: merged recursively;
/// - object carrying `__REPLACE__: true`: replaces the target entry wholesale;
/// - anything else (scalars, arrays, type mismatches): `source` wins.
///
/// Merge markers never survive into `target`.
pub fn deep_merge(target: &mut Map<String, JsonValue>, source: Map<String, JsonValue>) {
    for (key, value) in source {
        match value {
            JsonValue::Object(mut incoming) => {
                let replace = take_marker(&mut incoming, REPLACE_MARKER);
                match target.get_mut(&key) {
                    Some(JsonValue::Object(existing)) if !replace => {
                        deep_merge(existing, incoming);
                    }
                    _ => {
                        target.insert(key, JsonValue::Object(strip_markers(incoming)));
                    }
                }
            }
            other => {
                target.insert(key, other);
            }
        }
    }
}

/// Deep-merge two values, returning the merged result.
///
/// Non-object operands fall back to "right-hand side wins".
pub fn merged(left: JsonValue, right: JsonValue) -> JsonValue {
    match (left, right) {
        (JsonValue::Object(mut l), JsonValue::Object(r)) => {
            deep_merge(&mut l, r);
            JsonValue::Object(l)
        }
        (_, r) => r,
    }
}

/// Remove `marker` from `map`, returning whether it was set to `true`.
pub fn take_marker(map: &mut Map<String, JsonValue>, marker: &str) -> bool {
    matches!(map.remove(marker), Some(JsonValue::Bool(true)))
}

fn strip_markers(map: Map<String, JsonValue>) -> Map<String, JsonValue> {
    let mut clean = Map::new();
    deep_merge(&mut clean, map);
    clean
}

/// Look up a dotted path (`_meta.build_version`) in a document.
///
/// Array elements can be addressed by numeric segments (`jobs.0.step`).
pub fn lookup_path<'a>(doc: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(doc, |node, segment| match node {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
