use serde_json::Value;

/// Keys that never participate in redundancy compaction, at any depth.
/// These are record metadata, not device readings.
const SKIP_KEYS: [&str; 4] = ["id", "device_id", "received_at", "protocol"];

/// Walks `path` ("data.meter.main.temp") through nested objects.
/// Returns `None` as soon as a segment is missing or the current node
/// is not an object.
pub fn value_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, segment| node.get(segment))
}

/// Removes the leaf addressed by `path`, leaving parent objects in
/// place even when they become empty. Returns whether a value was
/// actually removed.
pub fn remove_at(root: &mut Value, path: &str) -> bool {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return false;
    };
    let mut node = root;
    for segment in parents {
        node = match node.get_mut(*segment) {
            Some(child) => child,
            None => return false,
        };
    }
    node.as_object_mut()
        .and_then(|map| map.remove(*leaf))
        .is_some()
}

/// Dot-joined addresses of every scalar leaf under `root`.
///
/// Only plain objects are descended into; arrays and `null` count as
/// leaves. Metadata keys are skipped wherever they appear, so a device
/// field that happens to be named like one is invisible to the
/// compactor as well.
pub fn leaf_paths(root: &Value) -> Vec<String> {
    fn walk(node: &Value, prefix: &str, out: &mut Vec<String>) {
        let Value::Object(map) = node else { return };
        for (key, child) in map {
            if SKIP_KEYS.contains(&key.as_str()) {
                continue;
            }
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            match child {
                Value::Object(_) => walk(child, &path, out),
                _ => out.push(path),
            }
        }
    }

    let mut out = Vec::new();
    walk(root, "", &mut out);
    out
}

/// Three-way equality over canonical JSON values.
///
/// `serde_json` keeps object keys sorted, so structural equality here
/// coincides with equality of the canonical serialized form: `5` and
/// `5.0` differ, `"5"` and `5` differ, and key order never matters.
pub fn is_redundant(a: &Value, b: &Value, c: &Value) -> bool {
    a == b && b == c
}
