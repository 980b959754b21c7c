// ── Tree value and path handling ──
//
// Paths are absolute, slash-separated, and normalized: "/" is the root,
// "/users/abc" is two levels down. A location never holds an explicit
// null or an empty object; `prune` collapses both to "no value".

use serde_json::{Map, Value};

use crate::error::StoreError;

/// The root path.
pub const ROOT: &str = "/";

/// Validate a child path fragment and join it onto a base path.
///
/// The fragment may span multiple levels (`"a/b"`); every segment must be
/// non-empty.
pub fn join(base: &str, child: &str) -> Result<String, StoreError> {
    let trimmed = child.trim_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(str::is_empty) {
        return Err(StoreError::InvalidPath {
            path: child.to_owned(),
        });
    }
    if base == ROOT {
        Ok(format!("/{trimmed}"))
    } else {
        Ok(format!("{base}/{trimmed}"))
    }
}

/// The parent of a path, or `None` at the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// The last segment of a path, or `None` at the root.
pub fn key(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    path.rfind('/').map(|idx| &path[idx + 1..])
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Normalize a value the way the store does: explicit nulls vanish,
/// objects are pruned recursively, and empty objects vanish too.
pub fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| prune(v).map(|v| (k, v)))
                .collect();
            if pruned.is_empty() {
                None
            } else {
                Some(Value::Object(pruned))
            }
        }
        other => Some(other),
    }
}

/// Read the value at a path within a (pruned) tree.
pub fn value_at<'a>(root: Option<&'a Value>, path: &str) -> Option<&'a Value> {
    let mut node = root?;
    for seg in segments(path) {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

/// The keys of a location's children, in store order.
pub fn child_keys(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Write a (pre-`prune`d) value at a path, creating intermediate objects
/// as needed and collapsing ancestors that become empty.
pub(crate) fn write_at(root: &mut Option<Value>, path: &str, value: Option<Value>) {
    let segs: Vec<&str> = segments(path).collect();
    if segs.is_empty() {
        *root = value;
        return;
    }

    let mut tree = match root.take() {
        Some(Value::Object(map)) => map,
        // Overwriting a primitive (or nothing) at an ancestor level.
        _ => Map::new(),
    };
    write_rec(&mut tree, &segs, value);
    *root = if tree.is_empty() {
        None
    } else {
        Some(Value::Object(tree))
    };
}

fn write_rec(node: &mut Map<String, Value>, segs: &[&str], value: Option<Value>) {
    let seg = segs[0];
    if segs.len() == 1 {
        match value {
            Some(v) => {
                node.insert(seg.to_owned(), v);
            }
            None => {
                node.remove(seg);
            }
        }
        return;
    }

    let child = node
        .entry(seg.to_owned())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        // Descending through a primitive replaces it.
        *child = Value::Object(Map::new());
    }
    if let Value::Object(map) = child {
        write_rec(map, &segs[1..], value);
        if map.is_empty() {
            node.remove(seg);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_validates_segments() {
        assert_eq!(join("/", "users").unwrap(), "/users");
        assert_eq!(join("/users", "abc").unwrap(), "/users/abc");
        assert_eq!(join("/users", "a/b").unwrap(), "/users/a/b");
        assert!(join("/users", "").is_err());
        assert!(join("/users", "a//b").is_err());
    }

    #[test]
    fn parent_and_key() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(key("/"), None);
        assert_eq!(key("/a/b"), Some("b"));
    }

    #[test]
    fn prune_collapses_nulls_and_empty_objects() {
        assert_eq!(prune(json!(null)), None);
        assert_eq!(prune(json!({})), None);
        assert_eq!(prune(json!({"a": null})), None);
        assert_eq!(prune(json!({"a": {"b": null}})), None);
        assert_eq!(
            prune(json!({"a": 1, "b": null})),
            Some(json!({"a": 1}))
        );
    }

    #[test]
    fn write_at_creates_and_collapses() {
        let mut root = None;
        write_at(&mut root, "/a/b", Some(json!(1)));
        assert_eq!(root, Some(json!({"a": {"b": 1}})));

        write_at(&mut root, "/a/c", Some(json!(2)));
        assert_eq!(value_at(root.as_ref(), "/a/c"), Some(&json!(2)));

        write_at(&mut root, "/a/b", None);
        write_at(&mut root, "/a/c", None);
        assert_eq!(root, None);
    }

    #[test]
    fn write_at_replaces_primitive_ancestor() {
        let mut root = None;
        write_at(&mut root, "/a", Some(json!(5)));
        write_at(&mut root, "/a/b", Some(json!(1)));
        assert_eq!(root, Some(json!({"a": {"b": 1}})));
    }
}
