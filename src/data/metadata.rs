//! Nested metadata helpers.
//!
//! Metadata is a free-form JSON object (`serde_json::Map`). The map is ordered by key,
//! so equality is already insensitive to insertion order; [`compare_metadata`] adds
//! a readable report of where two trees differ.

use serde_json::{Map, Value};

/// Metadata tree attached to a data set.
pub type Metadata = Map<String, Value>;

/// Recursively merge `update` into `dest`. Values from `update` win, nested objects
/// are merged key by key.
pub fn deep_update(dest: &mut Metadata, update: &Metadata) {
    for (key, value) in update {
        match (dest.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_update(existing, incoming);
            }
            _ => {
                dest.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Compare two metadata trees.
///
/// Returns whether they are equal and a newline separated description of every
/// difference, naming the trees `a_name` and `b_name`.
pub fn compare_metadata(a: &Metadata, b: &Metadata, a_name: &str, b_name: &str) -> (bool, String) {
    let mut errors = Vec::new();
    compare_objects(a, b, a_name, b_name, &mut errors);
    (errors.is_empty(), errors.join("\n"))
}

fn compare_objects(a: &Metadata, b: &Metadata, a_path: &str, b_path: &str, errors: &mut Vec<String>) {
    for (key, a_value) in a {
        let a_key = format!("{a_path}[{key}]");
        let b_key = format!("{b_path}[{key}]");
        match b.get(key) {
            None => errors.push(format!("Key {a_key} not in {b_path}")),
            Some(b_value) => compare_values(a_value, b_value, &a_key, &b_key, errors),
        }
    }
    for key in b.keys() {
        if !a.contains_key(key) {
            errors.push(format!("Key {b_path}[{key}] not in {a_path}"));
        }
    }
}

fn compare_values(a: &Value, b: &Value, a_key: &str, b_key: &str, errors: &mut Vec<String>) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => compare_objects(a, b, a_key, b_key, errors),
        (Value::Array(a_items), Value::Array(b_items)) if a_items.len() == b_items.len() => {
            for (i, (a_item, b_item)) in a_items.iter().zip(b_items).enumerate() {
                compare_values(
                    a_item,
                    b_item,
                    &format!("{a_key}[{i}]"),
                    &format!("{b_key}[{i}]"),
                    errors,
                );
            }
        }
        _ if a == b => {}
        _ => errors.push(format!("Value of \"{a_key}\" (\"{a}\") not same as\n  \"{b_key}\" (\"{b}\")")),
    }
}
