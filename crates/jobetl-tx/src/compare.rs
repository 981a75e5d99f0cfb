//! Deep comparison of JSON documents for regression fixtures.

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comparison {
    /// One line per differing path.
    pub unequal_reasons: Vec<String>,
}

impl Comparison {
    pub fn is_equal(&self) -> bool {
        self.unequal_reasons.is_empty()
    }
}

/// Compare `actual` against `expected`, collecting every difference.
/// Numbers compare by value, so `2` equals `2.0`.
pub fn compare(actual: &Value, expected: &Value, actual_name: &str, expected_name: &str) -> Comparison {
    let mut out = Comparison::default();
    walk(actual, expected, actual_name, expected_name, &mut out.unequal_reasons);
    out
}

fn walk(a: &Value, b: &Value, a_path: &str, b_path: &str, reasons: &mut Vec<String>) {
    match (a, b) {
        (Value::Object(am), Value::Object(bm)) => {
            for (key, av) in am {
                let (ap, bp) = (format!("{a_path}.{key}"), format!("{b_path}.{key}"));
                match bm.get(key) {
                    Some(bv) => walk(av, bv, &ap, &bp, reasons),
                    None => reasons.push(format!("{bp} is missing ({ap} = {av})")),
                }
            }
            for (key, bv) in bm {
                if !am.contains_key(key) {
                    reasons.push(format!("{a_path}.{key} is missing ({b_path}.{key} = {bv})"));
                }
            }
        }
        (Value::Array(av), Value::Array(bv)) => {
            if av.len() != bv.len() {
                reasons.push(format!(
                    "{a_path} has {} elements, {b_path} has {}",
                    av.len(),
                    bv.len()
                ));
            }
            for (i, (x, y)) in av.iter().zip(bv).enumerate() {
                walk(x, y, &format!("{a_path}[{i}]"), &format!("{b_path}[{i}]"), reasons);
            }
        }
        (Value::Number(x), Value::Number(y)) => {
            if x.as_f64() != y.as_f64() {
                reasons.push(format!("{a_path} ({x}) != {b_path} ({y})"));
            }
        }
        _ => {
            if a != b {
                reasons.push(format!("{a_path} ({a}) != {b_path} ({b})"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_documents() {
        let doc = json!({"a": {"value": 2, "error": 0}, "b": [1, "x"]});
        let expected = json!({"a": {"value": 2.0, "error": 0}, "b": [1, "x"]});
        assert!(compare(&doc, &expected, "out", "exp").is_equal());
    }

    #[test]
    fn reports_every_difference() {
        let doc = json!({"a": {"value": 3, "error": 0}, "extra": true, "list": [1, 2]});
        let expected = json!({"a": {"value": 2, "error": 8}, "gone": null, "list": [1]});
        let result = compare(&doc, &expected, "testOutput", "expectedOutput");
        assert_eq!(
            result.unequal_reasons,
            vec![
                "testOutput.a.value (3) != expectedOutput.a.value (2)",
                "testOutput.a.error (0) != expectedOutput.a.error (8)",
                "expectedOutput.extra is missing (testOutput.extra = true)",
                "testOutput.list has 2 elements, expectedOutput.list has 1",
                "testOutput.gone is missing (expectedOutput.gone = null)",
            ]
        );
    }
}
