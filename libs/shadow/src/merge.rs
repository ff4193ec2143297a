//! Structural merge and diff over JSON object trees.
//!
//! All functions here are schema-agnostic: they operate on
//! `serde_json::Map<String, Value>` and never look at concrete types.
//!
//! # Merge rules
//!
//! For every key in the patch:
//!
//! - `null` removes the key from the target.
//! - an object merged onto an object recurses.
//! - an object merged onto anything else (or nothing) replaces it, with
//!   nested `null`s stripped.
//! - any other value overwrites, unless the target holds an object, which
//!   is a [`ShadowError::TypeConflict`].
//!
//! Merging never mutates its inputs, so a failed merge leaves the caller's
//! state untouched.

use serde_json::{Map, Value};

use crate::error::ShadowError;

/// Maximum nesting depth accepted in a patch.
pub const MAX_DEPTH: usize = 10;

/// Deep-merge `patch` onto `base`, returning the merged object.
pub fn merge(base: &Map<String, Value>, patch: &Map<String, Value>) -> Result<Map<String, Value>, ShadowError> {
    check_depth(patch, 1)?;
    let mut out = base.clone();
    merge_into(&mut out, patch, "")?;
    Ok(out)
}

/// Merge `patch` onto `base`, replacing the sub-tree under `key` wholesale
/// and deep-merging every other key.
pub fn merge_override(
    base: &Map<String, Value>,
    patch: &Map<String, Value>,
    key: &str,
) -> Result<Map<String, Value>, ShadowError> {
    check_depth(patch, 1)?;
    let mut out = base.clone();

    let mut rest = patch.clone();
    if let Some(replacement) = rest.remove(key) {
        match strip_nulls(replacement) {
            Value::Null => {
                out.remove(key);
            }
            value => {
                out.insert(key.to_string(), value);
            }
        }
    }

    merge_into(&mut out, &rest, "")?;
    Ok(out)
}

fn merge_into(
    target: &mut Map<String, Value>,
    patch: &Map<String, Value>,
    prefix: &str,
) -> Result<(), ShadowError> {
    for (key, value) in patch {
        let path = join_path(prefix, key);
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(nested) => match target.get_mut(key) {
                Some(Value::Object(existing)) => merge_into(existing, nested, &path)?,
                _ => {
                    let mut fresh = Map::new();
                    merge_into(&mut fresh, nested, &path)?;
                    target.insert(key.clone(), Value::Object(fresh));
                }
            },
            other => {
                if matches!(target.get(key), Some(Value::Object(_))) {
                    return Err(ShadowError::TypeConflict { path });
                }
                target.insert(key.clone(), other.clone());
            }
        }
    }
    Ok(())
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn check_depth(map: &Map<String, Value>, depth: usize) -> Result<(), ShadowError> {
    if depth > MAX_DEPTH {
        return Err(ShadowError::DepthExceeded { max: MAX_DEPTH });
    }
    map.values().try_for_each(|v| check_value_depth(v, depth + 1))
}

fn check_value_depth(value: &Value, depth: usize) -> Result<(), ShadowError> {
    match value {
        Value::Object(map) => check_depth(map, depth),
        Value::Array(items) => {
            if depth > MAX_DEPTH {
                return Err(ShadowError::DepthExceeded { max: MAX_DEPTH });
            }
            items.iter().try_for_each(|v| check_value_depth(v, depth + 1))
        }
        _ => Ok(()),
    }
}

/// Remove every `null` member from nested objects.
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Three-valued diff of `desire` against `report`.
///
/// - keys equal on both sides are omitted
/// - keys that differ, or exist only in `desire`, carry the desired value
/// - keys that exist only in `report` carry `null`
pub fn diff(desire: &Map<String, Value>, report: &Map<String, Value>) -> Map<String, Value> {
    let mut delta = Map::new();

    for (key, want) in desire {
        match report.get(key) {
            Some(have) if values_equal(want, have) => {}
            _ => {
                delta.insert(key.clone(), want.clone());
            }
        }
    }

    for key in report.keys() {
        if !desire.contains_key(key) {
            delta.insert(key.clone(), Value::Null);
        }
    }

    delta
}

/// Structural equality that ignores key order and compares numbers by value,
/// so `1`, `1.0` and `1u64` are the same.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x == y
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x == y
            } else {
                match (x.as_f64(), y.as_f64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                }
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, l)| y.get(k).is_some_and(|r| values_equal(l, r)))
        }
        _ => a == b,
    }
}

/// Split `map` into the keys accepted by `allow` and the names of the
/// rejected ones.
pub fn filter_keys<F>(map: Map<String, Value>, allow: F) -> (Map<String, Value>, Vec<String>)
where
    F: Fn(&str) -> bool,
{
    let mut kept = Map::new();
    let mut dropped = Vec::new();
    for (key, value) in map {
        if allow(&key) {
            kept.insert(key, value);
        } else {
            dropped.push(key);
        }
    }
    (kept, dropped)
}
