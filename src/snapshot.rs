use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::InstanceSet;

/// Comparable state of every instance of an entry, keyed by class name then
/// attribute name.
pub type StateSnapshot = IndexMap<String, IndexMap<String, Value>>;

pub fn snapshot(instances: &InstanceSet) -> StateSnapshot {
    instances.snapshot()
}

/// One attribute that differs between the ground-truth and model universes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMismatch {
    pub class_name: String,
    pub attribute: String,
    pub expected: Value,
    pub actual: Value,
}

/// Structural equality. Numbers compare by value, so `2` equals `2.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Attribute-by-attribute diff. A class or attribute missing on one side
/// is compared as `null`.
pub fn diff_snapshots(expected: &StateSnapshot, actual: &StateSnapshot) -> Vec<StateMismatch> {
    let empty = IndexMap::new();
    let mut mismatches = Vec::new();
    let class_names = expected
        .keys()
        .chain(actual.keys().filter(|k| !expected.contains_key(*k)));
    for class_name in class_names {
        let expected_attrs = expected.get(class_name).unwrap_or(&empty);
        let actual_attrs = actual.get(class_name).unwrap_or(&empty);
        let attributes = expected_attrs
            .keys()
            .chain(actual_attrs.keys().filter(|k| !expected_attrs.contains_key(*k)));
        for attribute in attributes {
            let expected_value = expected_attrs.get(attribute).unwrap_or(&Value::Null);
            let actual_value = actual_attrs.get(attribute).unwrap_or(&Value::Null);
            if !values_equal(expected_value, actual_value) {
                mismatches.push(StateMismatch {
                    class_name: class_name.clone(),
                    attribute: attribute.clone(),
                    expected: expected_value.clone(),
                    actual: actual_value.clone(),
                });
            }
        }
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn state(value: Value) -> StateSnapshot {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_numeric_widening() {
        assert!(values_equal(&json!([1, {"a": 2}]), &json!([1.0, {"a": 2.0}])));
        assert!(!values_equal(&json!(1), &json!("1")));
        assert!(!values_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_diff_reports_each_attribute() {
        let expected = state(json!({"BaseApi": {"wifi": true, "logged_in": true}}));
        let actual = state(json!({"BaseApi": {"wifi": false, "logged_in": true}}));
        assert_eq!(
            diff_snapshots(&expected, &actual),
            vec![StateMismatch {
                class_name: "BaseApi".to_string(),
                attribute: "wifi".to_string(),
                expected: json!(true),
                actual: json!(false),
            }]
        );
    }

    #[test]
    fn test_missing_class_is_compared_as_null() {
        let expected = state(json!({"MathAPI": {}, "BaseApi": {"wifi": true}}));
        let actual = state(json!({"MathAPI": {}}));
        let diff = diff_snapshots(&expected, &actual);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].actual, Value::Null);
        assert!(diff_snapshots(&expected, &expected).is_empty());
    }
}
