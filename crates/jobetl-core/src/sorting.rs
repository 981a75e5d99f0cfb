//! Multi-key ordering of JSON objects.

use std::cmp::Ordering;

use serde_json::Value;

/// Compare two objects by each key in turn until one differs.
///
/// A key missing from either object compares equal, so the next key (or the
/// input order) decides. Present values follow [`compare_values`].
pub fn compare_by_keys(a: &Value, b: &Value, keys: &[&str]) -> Ordering {
    keys.iter()
        .map(|key| match (a.get(key), b.get(key)) {
            (Some(x), Some(y)) => compare_values(Some(x), Some(y)),
            _ => Ordering::Equal,
        })
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Sort `items` in place by `keys`. The sort is stable.
pub fn sort_by_keys(items: &mut [Value], keys: &[&str]) {
    items.sort_by(|a, b| compare_by_keys(a, b, keys));
}

fn rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(_) => 4,
    }
}

/// Order two optional values. Missing values and `null` sort first, numbers
/// compare numerically and strings lexicographically. Values of different
/// kinds order as null < bool < number < string < anything else.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_by_successive_keys() {
        let mut items = vec![
            json!({"dtype": "statistic", "group": "misc", "name": "b"}),
            json!({"dtype": "foreignkey", "group": "misc", "name": "z"}),
            json!({"dtype": "statistic", "group": "cpu", "name": "c"}),
            json!({"dtype": "statistic", "group": "misc", "units": "s", "name": "a"}),
        ];
        sort_by_keys(&mut items, &["dtype", "group", "units", "name"]);
        let names: Vec<_> = items.iter().map(|i| i["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["z", "c", "a", "b"]);
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(
            compare_by_keys(&json!({"n": 9}), &json!({"n": 10}), &["n"]),
            Ordering::Less
        );
        assert_eq!(
            compare_values(None, Some(&json!(0))),
            Ordering::Less
        );
    }

    #[test]
    fn missing_keys_keep_input_order() {
        let mut items = vec![
            json!({"name": "b"}),
            json!({"name": "a", "units": "s"}),
            json!({"name": "c"}),
        ];
        sort_by_keys(&mut items, &["units"]);
        let names: Vec<_> = items.iter().map(|i| i["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(
            compare_by_keys(&json!({}), &json!({"n": 0}), &["n"]),
            Ordering::Equal
        );
    }
}
