//! Formulas declared in the profile.
//!
//! Each [`FormulaSpec`] becomes a [`FormulaFn`] over the whole document.
//! Inputs are looked up like `ref` mappings. A missing input makes the
//! formula yield `null` with that input's error code, so the attribute
//! falls back to its schema default.

use std::collections::BTreeMap;

use jobetl_core::config::FormulaSpec;
use jobetl_core::mapping::{self, FormulaError, FormulaRegistry, Resolved};
use jobetl_core::types::FieldType;
use jobetl_core::MetricErrors;
use serde_json::Value;
use tracing::debug;

/// Register every declared formula whose name is still free. Formulas
/// registered in code keep precedence.
pub fn register(registry: &mut FormulaRegistry, specs: &BTreeMap<String, FormulaSpec>) {
    for (name, spec) in specs {
        if registry.contains(name) {
            debug!(formula = %name, "formula already registered, declaration ignored");
            continue;
        }
        let spec = spec.clone();
        registry.register(name.clone(), move |doc: &Value| evaluate(&spec, doc));
    }
}

/// Evaluate `spec` against `doc`.
pub fn evaluate(spec: &FormulaSpec, doc: &Value) -> Result<Resolved, FormulaError> {
    match spec {
        FormulaSpec::Sum { refs } => {
            let mut total = 0.0;
            for path in refs {
                match number(doc, path) {
                    Ok(x) => total += x,
                    Err(missing) => return Ok(missing),
                }
            }
            Ok(Resolved::ok(finite(total)?))
        }
        FormulaSpec::Difference { minuend, subtrahend } => {
            let (a, b) = match (number(doc, minuend), number(doc, subtrahend)) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(missing), _) | (_, Err(missing)) => return Ok(missing),
            };
            Ok(Resolved::ok(finite(a - b)?))
        }
        FormulaSpec::Ratio {
            numerator,
            denominator,
        } => {
            let (a, b) = match (number(doc, numerator), number(doc, denominator)) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(missing), _) | (_, Err(missing)) => return Ok(missing),
            };
            if b == 0.0 {
                return Err(FormulaError::Type(format!("{denominator} is zero")));
            }
            Ok(Resolved::ok(finite(a / b)?))
        }
        FormulaSpec::Scale { path, factor } => match number(doc, path) {
            Ok(x) => Ok(Resolved::ok(finite(x * factor)?)),
            Err(missing) => Ok(missing),
        },
        FormulaSpec::Count { path } => {
            let found = mapping::resolve(doc, std::slice::from_ref(path), None);
            match found.value {
                Some(Value::Array(items)) => Ok(Resolved::ok(Value::from(items.len()))),
                Some(other) => Err(FormulaError::Type(format!("{path} is not an array: {other}"))),
                None => Ok(Resolved {
                    value: Some(Value::Null),
                    error: found.error,
                }),
            }
        }
    }
}

/// The numeric value at `path`, or the `null` result to return when it is
/// absent.
fn number(doc: &Value, path: &str) -> Result<f64, Resolved> {
    let found = mapping::resolve(doc, &[path.to_string()], Some(&FieldType::Double));
    match found.value.as_ref().and_then(as_f64) {
        Some(x) => Ok(x),
        None => Err(Resolved {
            value: Some(Value::Null),
            error: if found.error == MetricErrors::OK {
                MetricErrors::MISSING_UNKNOWN_REASON
            } else {
                found.error
            },
        }),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn finite(x: f64) -> Result<Value, FormulaError> {
    if !x.is_finite() {
        return Err(FormulaError::Type(format!("result {x} is not finite")));
    }
    if x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        return Ok(Value::from(x as i64));
    }
    serde_json::Number::from_f64(x)
        .map(Value::Number)
        .ok_or_else(|| FormulaError::Type(format!("result {x} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(yaml: &str) -> FormulaSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn arithmetic_over_document_paths() {
        let doc = json!({
            "acct": {"start_time": 100, "end_time": 460, "hosts": ["c1", "c2", "c3"]},
            "cpu": {"user": 30.0, "system": 10.0, "all": 80.0},
        });
        let eval = |y: &str| evaluate(&spec(y), &doc).unwrap().value.unwrap();
        assert_eq!(eval("{op: difference, minuend: acct.end_time, subtrahend: acct.start_time}"), json!(360));
        assert_eq!(eval("{op: sum, refs: [cpu.user, cpu.system]}"), json!(40));
        assert_eq!(eval("{op: ratio, numerator: cpu.user, denominator: cpu.all}"), json!(0.375));
        assert_eq!(eval("{op: scale, ref: cpu.all, factor: 0.5}"), json!(40));
        assert_eq!(eval("{op: count, ref: acct.hosts}"), json!(3));
    }

    #[test]
    fn missing_inputs_carry_their_error() {
        let doc = json!({"cpu": {"error": 2, "all": 10}});
        let r = evaluate(&spec("{op: ratio, numerator: cpu.user, denominator: cpu.all}"), &doc).unwrap();
        assert_eq!(r.value, Some(Value::Null));
        assert_eq!(r.error, MetricErrors::NOT_AVAILABLE_ON_HOST);

        let r = evaluate(&spec("{op: count, ref: acct.hosts}"), &json!({})).unwrap();
        assert_eq!(r.value, Some(Value::Null));
        assert_eq!(r.error, MetricErrors::MISSING_UNKNOWN_REASON);
    }

    #[test]
    fn bad_shapes_are_type_errors() {
        let doc = json!({"a": 1, "zero": 0, "hosts": "c1"});
        assert!(matches!(
            evaluate(&spec("{op: ratio, numerator: a, denominator: zero}"), &doc),
            Err(FormulaError::Type(_))
        ));
        assert!(matches!(
            evaluate(&spec("{op: count, ref: hosts}"), &doc),
            Err(FormulaError::Type(_))
        ));
    }

    #[test]
    fn code_registered_formulas_win() {
        let mut registry = FormulaRegistry::new();
        registry.register("wall", |_: &Value| Ok(Resolved::ok(json!(1))));
        let mut specs = BTreeMap::new();
        specs.insert("wall".to_string(), spec("{op: scale, ref: x, factor: 2}"));
        specs.insert("double".to_string(), spec("{op: scale, ref: x, factor: 2}"));
        register(&mut registry, &specs);

        let doc = json!({"x": 4});
        let wall = registry.get("wall").unwrap();
        assert_eq!(wall(&doc).unwrap().value, Some(json!(1)));
        let double = registry.get("double").unwrap();
        assert_eq!(double(&doc).unwrap().value, Some(json!(8)));
    }
}
