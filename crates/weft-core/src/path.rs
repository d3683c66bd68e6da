//! Dotted-path access into a [`Value`] tree.
//!
//! Paths look like `"math.add"` or `"rows.0.label"`. Numeric segments
//! address array slots; writing through a numeric segment creates an array
//! and pads missing slots with null.

use crate::value::Value;

/// Read the value at a dotted path.
pub fn path_get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match (current, segment.parse::<usize>()) {
            (Value::Array(items), Ok(index)) => items.get(index)?,
            (Value::Map(entries), _) => entries.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a value at a dotted path, creating intermediate containers.
///
/// Numeric segments create arrays; everything else creates maps. A
/// non-container in the way is replaced.
pub fn path_set(root: &mut Value, path: &str, value: Value) {
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();

    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        let index = segment.parse::<usize>().ok();

        match index {
            Some(index) => {
                if !matches!(current, Value::Array(_)) {
                    *current = Value::Array(Vec::new());
                }
                let Value::Array(items) = current else {
                    unreachable!()
                };
                while items.len() <= index {
                    items.push(Value::Null);
                }
                if last {
                    items[index] = value;
                    return;
                }
                current = &mut items[index];
            }
            None => {
                if !matches!(current, Value::Map(_)) {
                    *current = Value::empty_map();
                }
                let Value::Map(entries) = current else {
                    unreachable!()
                };
                if last {
                    entries.insert(segment.to_string(), value);
                    return;
                }
                current = entries.entry(segment.to_string()).or_insert(Value::Null);
            }
        }
    }
}
