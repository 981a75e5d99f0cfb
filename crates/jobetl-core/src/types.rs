//! Semantic field types and the type validator.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Semantic type of a schema field.
///
/// Unrecognized type names are preserved as [`FieldType::Unknown`] rather
/// than rejected at load time, so that the validator can report them as a
/// schema authoring error against the attribute that uses them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    Int32,
    Uint32,
    Tinyint,
    Double,
    String,
    Array,
    Timestamp,
    Unknown(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Int32 => "int32",
            FieldType::Uint32 => "uint32",
            FieldType::Tinyint => "tinyint",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::Array => "array",
            FieldType::Timestamp => "timestamp",
            FieldType::Unknown(name) => name,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Int32
                | FieldType::Uint32
                | FieldType::Tinyint
                | FieldType::Double
                | FieldType::Timestamp
        )
    }

    fn is_integer(&self) -> bool {
        matches!(
            self,
            FieldType::Int32 | FieldType::Uint32 | FieldType::Tinyint | FieldType::Timestamp
        )
    }

    fn is_unsigned(&self) -> bool {
        matches!(self, FieldType::Uint32 | FieldType::Timestamp)
    }
}

impl From<String> for FieldType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "int32" => FieldType::Int32,
            "uint32" => FieldType::Uint32,
            "tinyint" => FieldType::Tinyint,
            "double" => FieldType::Double,
            "string" => FieldType::String,
            "array" => FieldType::Array,
            "timestamp" => FieldType::Timestamp,
            _ => FieldType::Unknown(name),
        }
    }
}

impl From<FieldType> for String {
    fn from(ty: FieldType) -> Self {
        ty.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How loudly a failed check should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// A bad value in one document; the default is substituted.
    Warning,
    /// A schema authoring mistake.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCheckError {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCheck {
    pub is_valid: bool,
    pub error: Option<TypeCheckError>,
}

impl TypeCheck {
    fn valid() -> Self {
        Self {
            is_valid: true,
            error: None,
        }
    }

    fn invalid(severity: Severity, message: String) -> Self {
        Self {
            is_valid: false,
            error: Some(TypeCheckError { severity, message }),
        }
    }
}

static FLOAT_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?(?:Infinity|(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)")
        .expect("static float prefix pattern")
});

/// Lenient numeric parse: numbers are taken as-is, strings contribute their
/// longest leading decimal literal (`"12.5 s"` parses as 12.5), everything
/// else is not a number.
pub fn parse_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim_start();
            let literal = FLOAT_PREFIX.find(trimmed)?.as_str();
            let unsigned = literal.trim_start_matches(['+', '-']);
            if unsigned == "Infinity" {
                return Some(if literal.starts_with('-') {
                    f64::NEG_INFINITY
                } else {
                    f64::INFINITY
                });
            }
            literal.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Validate `value` against `ty`. `label` names the attribute in messages.
pub fn check(value: &Value, ty: &FieldType, label: &str) -> TypeCheck {
    match ty {
        FieldType::Int32
        | FieldType::Uint32
        | FieldType::Tinyint
        | FieldType::Double
        | FieldType::Timestamp => match parse_float(value) {
            Some(n) if n.is_finite() => {
                if ty.is_unsigned() && n < 0.0 {
                    TypeCheck::invalid(
                        Severity::Warning,
                        format!("Attribute {ty} \"{label}\" is negative: {value}"),
                    )
                } else {
                    TypeCheck::valid()
                }
            }
            _ => TypeCheck::invalid(
                Severity::Warning,
                format!("Attribute {ty} \"{label}\" is not a finite number: {value}"),
            ),
        },
        FieldType::String => {
            if value.is_string() {
                TypeCheck::valid()
            } else {
                TypeCheck::invalid(
                    Severity::Warning,
                    format!("Attribute {ty} \"{label}\" is not a string: {value}"),
                )
            }
        }
        FieldType::Array => {
            if value.is_array() {
                TypeCheck::valid()
            } else {
                TypeCheck::invalid(
                    Severity::Warning,
                    format!("Attribute {ty} \"{label}\" is not an array: {value}"),
                )
            }
        }
        FieldType::Unknown(name) => TypeCheck::invalid(
            Severity::Error,
            format!("Attribute \"{label}\" has unknown type \"{name}\""),
        ),
    }
}

/// Convert a value that passed [`check`] into its canonical JSON form.
///
/// Only numeric strings are rewritten; values already carrying the right
/// JSON type are returned unchanged.
pub fn coerce(value: Value, ty: &FieldType) -> Value {
    if !ty.is_numeric() {
        return value;
    }
    let Value::String(_) = value else {
        return value;
    };
    let Some(n) = parse_float(&value).filter(|n| n.is_finite()) else {
        return value;
    };
    if ty.is_integer() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_float_takes_leading_literal() {
        assert_eq!(parse_float(&json!("12.5")), Some(12.5));
        assert_eq!(parse_float(&json!("  3e2kb")), Some(300.0));
        assert_eq!(parse_float(&json!(".5")), Some(0.5));
        assert_eq!(parse_float(&json!("abc")), None);
        assert_eq!(parse_float(&json!(true)), None);
        assert_eq!(parse_float(&json!(null)), None);
        assert_eq!(parse_float(&json!(7)), Some(7.0));
        assert_eq!(parse_float(&json!("-Infinity")), Some(f64::NEG_INFINITY));
    }

    #[test]
    fn numeric_types_require_finite_numbers() {
        assert!(check(&json!("12.5"), &FieldType::Double, "cpu").is_valid);
        assert!(check(&json!(-4), &FieldType::Int32, "x").is_valid);
        let bad = check(&json!("n/a"), &FieldType::Double, "cpu");
        assert!(!bad.is_valid);
        assert_eq!(bad.error.unwrap().severity, Severity::Warning);
        assert!(!check(&json!("Infinity"), &FieldType::Double, "cpu").is_valid);
    }

    #[test]
    fn uint32_rejects_negative() {
        assert!(!check(&json!(-1), &FieldType::Uint32, "n").is_valid);
        assert!(check(&json!(0), &FieldType::Uint32, "n").is_valid);
    }

    #[test]
    fn string_and_array_are_strict() {
        assert!(!check(&json!(5), &FieldType::String, "s").is_valid);
        assert!(check(&json!("5"), &FieldType::String, "s").is_valid);
        assert!(check(&json!([1, 2]), &FieldType::Array, "a").is_valid);
        assert!(!check(&json!({"a": 1}), &FieldType::Array, "a").is_valid);
    }

    #[test]
    fn unknown_type_is_an_error_severity() {
        let ty = FieldType::from("decimal".to_string());
        let result = check(&json!(1), &ty, "d");
        assert!(!result.is_valid);
        assert_eq!(result.error.unwrap().severity, Severity::Error);
    }

    #[test]
    fn coerce_numeric_strings() {
        assert_eq!(coerce(json!("12.5"), &FieldType::Double), json!(12.5));
        assert_eq!(coerce(json!("12"), &FieldType::Int32), json!(12));
        assert_eq!(coerce(json!(3), &FieldType::Double), json!(3));
        assert_eq!(coerce(json!("x"), &FieldType::String), json!("x"));
    }
}
