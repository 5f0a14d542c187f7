//! Local mirror of one realtime log address.
//!
//! DESIGN
//! ======
//! The streaming endpoint sends the initial value as a `put` at `/` and
//! then incremental `put`/`patch` events at sub-paths. Consumers of a
//! `RealtimeLog` only ever see full snapshots, so the mirror folds each
//! event into the current tree and hands back the whole value.
//!
//! Nulls delete, and objects left empty by a delete collapse to null, so
//! "no children" and "absent" are the same state.

use serde_json::{Map, Value};

#[derive(Debug, Default)]
pub struct SnapshotMirror {
    root: Value,
}

impl SnapshotMirror {
    #[must_use]
    pub fn new() -> Self {
        Self { root: Value::Null }
    }

    /// Replace the value at `path` (`"/"` replaces the whole tree).
    pub fn put(&mut self, path: &str, data: Value) {
        let segments = split_path(path);
        set_at(&mut self.root, &segments, prune(data));
    }

    /// Merge each child of `data` into the object at `path`.
    ///
    /// A non-object payload is treated as a `put`.
    pub fn patch(&mut self, path: &str, data: Value) {
        let Value::Object(children) = data else {
            self.put(path, data);
            return;
        };

        let mut segments = split_path(path);
        for (key, value) in children {
            segments.push(key.clone());
            set_at(&mut self.root, &segments, prune(value));
            segments.pop();
        }
    }

    /// Current value, `None` when the address holds nothing.
    #[must_use]
    pub fn snapshot(&self) -> Option<&Value> {
        if self.root.is_null() { None } else { Some(&self.root) }
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn set_at(node: &mut Value, segments: &[String], data: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = data;
        return;
    };

    if !node.is_object() {
        if data.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };

    let child = map.entry(head.clone()).or_insert(Value::Null);
    set_at(child, rest, data);
    if child.is_null() {
        map.remove(head);
    }
    if map.is_empty() {
        *node = Value::Null;
    }
}

fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if pruned.is_empty() { Value::Null } else { Value::Object(pruned) }
        }
        other => other,
    }
}

#[cfg(test)]
#[path = "mirror_test.rs"]
mod tests;
