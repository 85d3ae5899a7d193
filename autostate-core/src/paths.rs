//! Dotted/bracketed property paths over a JSON context.
//!
//! A path like `items[0].status` splits into `items`, `0`, `status`.
//! Resolution walks the context as a nested property map; any non-map,
//! non-array node along the way terminates with `None`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::types::Context;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PathSeg {
    Key(String),
    Index(usize),
}

/// Split on `.`, expanding `name[i][j]` into `name, i, j`. Bracketed
/// segments that are not unsigned integers are treated as string keys.
pub(crate) fn parse_path(path: &str) -> Vec<PathSeg> {
    let mut segs = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let mut rest = part;
        if let Some(open) = rest.find('[') {
            let head = &rest[..open];
            if !head.is_empty() {
                segs.push(PathSeg::Key(head.to_string()));
            }
            rest = &rest[open..];
            while let Some(close) = rest.find(']') {
                let inner = &rest[1..close];
                match inner.parse::<usize>() {
                    Ok(i) => segs.push(PathSeg::Index(i)),
                    Err(_) => segs.push(PathSeg::Key(inner.to_string())),
                }
                rest = &rest[close + 1..];
                if !rest.starts_with('[') {
                    break;
                }
            }
        } else {
            segs.push(PathSeg::Key(part.to_string()));
        }
    }
    segs
}

pub(crate) fn resolve<'a>(ctx: &'a Context, segs: &[PathSeg]) -> Option<&'a Value> {
    let mut node = ctx;
    for seg in segs {
        node = match (node, seg) {
            (Value::Object(map), PathSeg::Key(k)) => map.get(k)?,
            (Value::Array(items), PathSeg::Index(i)) => items.get(*i)?,
            // Integer segment against an object still resolves by key.
            (Value::Object(map), PathSeg::Index(i)) => map.get(&i.to_string())?,
            _ => return None,
        };
    }
    Some(node)
}

/// A path differs if the resolved values are unequal, or exactly one side
/// fails to resolve.
pub(crate) fn path_differs(prev: &Context, next: &Context, segs: &[PathSeg]) -> bool {
    match (resolve(prev, segs), resolve(next, segs)) {
        (None, None) => false,
        (Some(a), Some(b)) => a != b,
        _ => true,
    }
}

/// First segment of a dotted/bracketed path as written (`items[0].status`
/// → `items`). Used for memo invalidation, which is keyed on top-level
/// context keys.
pub(crate) fn head_key(path: &str) -> &str {
    let end = path
        .find(['.', '['])
        .unwrap_or(path.len());
    &path[..end]
}

/// Parse cache, keyed by the path string. One per state.
#[derive(Default)]
pub(crate) struct PathCache {
    parsed: Mutex<HashMap<String, std::sync::Arc<Vec<PathSeg>>>>,
}

impl PathCache {
    pub(crate) fn get(&self, path: &str) -> std::sync::Arc<Vec<PathSeg>> {
        let mut cache = self.parsed.lock().unwrap();
        cache
            .entry(path.to_string())
            .or_insert_with(|| std::sync::Arc::new(parse_path(path)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_dotted_and_bracketed() {
        assert_eq!(
            parse_path("items[0].status"),
            vec![
                PathSeg::Key("items".into()),
                PathSeg::Index(0),
                PathSeg::Key("status".into()),
            ]
        );
        assert_eq!(
            parse_path("grid[1][2]"),
            vec![
                PathSeg::Key("grid".into()),
                PathSeg::Index(1),
                PathSeg::Index(2),
            ]
        );
        assert_eq!(parse_path("plain"), vec![PathSeg::Key("plain".into())]);
    }

    #[test]
    fn resolves_through_arrays_and_objects() {
        let ctx = json!({"items": [{"status": "ok"}, {"status": "bad"}]});
        let segs = parse_path("items[1].status");
        assert_eq!(resolve(&ctx, &segs), Some(&json!("bad")));
    }

    #[test]
    fn non_map_nodes_terminate_with_none() {
        let ctx = json!({"a": 42});
        assert_eq!(resolve(&ctx, &parse_path("a.b.c")), None);
    }

    #[test]
    fn differs_on_value_change_and_presence_change() {
        let segs = parse_path("count");
        assert!(path_differs(&json!({}), &json!({"count": 1}), &segs));
        assert!(path_differs(&json!({"count": 1}), &json!({"count": 2}), &segs));
        assert!(!path_differs(
            &json!({"count": 1, "x": 1}),
            &json!({"count": 1, "x": 2}),
            &segs
        ));
    }

    #[test]
    fn head_key_strips_suffix() {
        assert_eq!(head_key("items[0].status"), "items");
        assert_eq!(head_key("user.name"), "user");
        assert_eq!(head_key("flat"), "flat");
    }
}
