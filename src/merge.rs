//! Deep merge for JSON values
//!
//! Used for config, metadata, and query-option defaults where a source
//! object is layered on top of a destination object.

use serde_json::Value;

/// Deep-merge `src` onto `dest`.
///
/// Objects merge key-by-key recursively; any other source value (including
/// null and arrays) replaces the destination value wholesale.
pub(crate) fn deep_merge(dest: &mut Value, src: Value) {
    match (dest, src) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            for (key, src_val) in src_map {
                match dest_map.get_mut(&key) {
                    Some(dest_val) => deep_merge(dest_val, src_val),
                    None => {
                        dest_map.insert(key, src_val);
                    }
                }
            }
        }
        (dest, src) => *dest = src,
    }
}

/// Deep-merge two values into a new value, `overlay` winning.
pub(crate) fn merged(base: &Value, overlay: &Value) -> Value {
    let mut out = base.clone();
    deep_merge(&mut out, overlay.clone());
    out
}
