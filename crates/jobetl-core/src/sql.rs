//! SQL text helpers shared by the transform and load stages: value
//! escaping, `:name` placeholder binding and column type mapping.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::types::FieldType;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":(\w+)").expect("static placeholder pattern"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SqlTypeError {
    #[error("type {0} should not be in a table as a column")]
    NotAColumn(String),
    #[error("type {0} is unknown")]
    Unknown(String),
}

/// Escape a JSON value as a MySQL literal.
pub fn escape(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => escape_string(s),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Array(_) => format!("({})", escape(item)),
                _ => escape(item),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => escape_object(map),
    }
}

fn escape_object(map: &Map<String, Value>) -> String {
    map.iter()
        .map(|(key, value)| format!("{} = {}", escape_identifier(key), escape(value)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Quote and escape a string literal.
pub fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\u{8}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{1a}' => out.push_str("\\Z"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Backtick-quote an identifier, splitting on dots.
pub fn escape_identifier(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Replace every `:name` placeholder whose name is bound in `values` with the
/// escaped value. Unbound placeholders are left as they are.
pub fn query_format<'a, I>(query: &str, values: I) -> String
where
    I: Fn(&str) -> Option<&'a Value>,
{
    PLACEHOLDER
        .replace_all(query, |caps: &Captures<'_>| match values(&caps[1]) {
            Some(value) => escape(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Convenience wrapper of [`query_format`] for a JSON object of bindings.
pub fn query_format_map(query: &str, values: &Map<String, Value>) -> String {
    query_format(query, |key| values.get(key))
}

/// MySQL column type for a schema field type.
pub fn sql_type(ty: &FieldType, length: Option<u32>) -> Result<String, SqlTypeError> {
    match ty {
        FieldType::Uint32 | FieldType::Timestamp => Ok("int unsigned".to_string()),
        FieldType::Int32 => Ok("int".to_string()),
        FieldType::Tinyint => Ok("tinyint".to_string()),
        FieldType::Double => Ok("double".to_string()),
        FieldType::String => Ok(format!("varchar({})", length.unwrap_or(50))),
        FieldType::Array => Err(SqlTypeError::NotAColumn(ty.to_string())),
        FieldType::Unknown(name) => Err(SqlTypeError::Unknown(name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn escapes_scalars() {
        assert_eq!(escape(&json!(null)), "NULL");
        assert_eq!(escape(&json!(12.5)), "12.5");
        assert_eq!(escape(&json!(true)), "true");
        assert_eq!(escape(&json!("O'Brien\n")), "'O\\'Brien\\n'");
        assert_eq!(escape(&json!([1, "a"])), "1, 'a'");
    }

    #[test]
    fn binds_known_placeholders_only() {
        let values = json!({"resource": "frank", "n": 3});
        let out = query_format_map(
            "SELECT id FROM r WHERE code = :resource AND n > :n AND x = :missing",
            values.as_object().unwrap(),
        );
        assert_eq!(
            out,
            "SELECT id FROM r WHERE code = 'frank' AND n > 3 AND x = :missing"
        );
    }

    #[test]
    fn maps_column_types() {
        assert_eq!(sql_type(&FieldType::Uint32, None).unwrap(), "int unsigned");
        assert_eq!(sql_type(&FieldType::String, None).unwrap(), "varchar(50)");
        assert_eq!(sql_type(&FieldType::String, Some(255)).unwrap(), "varchar(255)");
        assert!(matches!(
            sql_type(&FieldType::Array, None),
            Err(SqlTypeError::NotAColumn(_))
        ));
        assert!(matches!(
            sql_type(&FieldType::from("blob".to_string()), None),
            Err(SqlTypeError::Unknown(_))
        ));
    }
}
