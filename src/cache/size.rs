//! Approximate value sizes.
//!
//! | Shape | Estimate |
//! |-------|----------|
//! | string | 2 bytes per char |
//! | number | 8 |
//! | bool | 4 |
//! | null | 0 |
//! | array / object | JSON length × 2 + [`COMPOSITE_OVERHEAD`] |
//!
//! Never fails: anything that cannot be measured costs [`FALLBACK_SIZE`].

use serde::Serialize;
use serde_json::Value;

/// Size charged when a value cannot be measured.
pub const FALLBACK_SIZE: usize = 1024;

/// Fixed charge for arrays and objects.
pub const COMPOSITE_OVERHEAD: usize = 64;

/// Estimates the resident size of any serializable value.
#[must_use]
pub fn estimate_size<V: Serialize + ?Sized>(value: &V) -> usize {
    serde_json::to_value(value).map_or(FALLBACK_SIZE, |value| estimate_value(&value))
}

/// Estimates the resident size of a JSON value.
#[must_use]
pub fn estimate_value(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => s.chars().count() * 2,
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value)
            .map_or(FALLBACK_SIZE, |json| json.len() * 2 + COMPOSITE_OVERHEAD),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use serde::ser::Error as _;
    use serde_json::json;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("nope"))
        }
    }

    #[test]
    fn test_scalars() {
        assert_eq!(estimate_size("héllo"), 10);
        assert_eq!(estimate_size(&42_u64), 8);
        assert_eq!(estimate_size(&-1.5_f64), 8);
        assert_eq!(estimate_size(&true), 4);
        assert_eq!(estimate_size(&()), 0);
    }

    #[test]
    fn test_composite() {
        let value = json!({"a": 1});
        let json_len = r#"{"a":1}"#.len();
        assert_eq!(estimate_value(&value), json_len * 2 + COMPOSITE_OVERHEAD);
    }

    #[test]
    fn test_non_string_keys_fall_back() {
        let mut map = BTreeMap::new();
        map.insert(vec![1_u8], 1);
        assert_eq!(estimate_size(&map), FALLBACK_SIZE);
    }

    #[test]
    fn test_failure_falls_back() {
        assert_eq!(estimate_size(&Unserializable), FALLBACK_SIZE);
    }
}
