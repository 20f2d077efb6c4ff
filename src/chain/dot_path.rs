// Conduit — Dot-path projection
//
// The only expression language a chain understands: `a.b.0.c` walks object
// keys and numeric array indices. A path that runs off the data yields
// nothing, and a mapping whose source is missing simply omits its target.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Walk `path` through `value`. An empty path is the value itself.
pub fn extract<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(fields) => fields.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Build `{target: value[source]}` for every mapping whose source resolves.
pub fn project(value: &Value, mapping: &BTreeMap<String, String>) -> Map<String, Value> {
    let mut projected = Map::new();
    for (source, target) in mapping {
        match extract(value, source) {
            Some(found) => {
                projected.insert(target.clone(), found.clone());
            }
            None => {
                tracing::debug!(source = %source, target = %target, "Output mapping source not found");
            }
        }
    }
    projected
}
