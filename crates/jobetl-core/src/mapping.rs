//! Declarative per-dataset mappings from source documents to schema fields.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::metric_errors::MetricErrors;
use crate::types::{self, FieldType};

/// Keys an attribute mapping may carry.
const ATTRIBUTE_KEYS: &[&str] = &["ref", "value", "error", "formula", "required", "comments"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("attribute \"{0}\" must be an object")]
    NotAnObject(String),
    #[error("attribute \"{attribute}\" has unsupported property \"{key}\"")]
    UnknownKey { attribute: String, key: String },
    #[error("attribute \"{0}\": ref must be a dotted path or a non-empty list of paths")]
    InvalidRef(String),
    #[error("attribute \"{0}\": error must be a metric error code")]
    InvalidErrorCode(String),
    #[error("attribute \"{0}\": formula must name a registered formula")]
    InvalidFormula(String),
    #[error("attribute \"{attribute}\": formula \"{formula}\" is not registered")]
    UnknownFormula { attribute: String, formula: String },
    #[error("attribute \"{0}\" does not have a schema field")]
    NoSchemaField(String),
}

/// Outcome of looking a value up in a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// `None` when no path reached a value.
    pub value: Option<Value>,
    pub error: MetricErrors,
}

impl Resolved {
    pub fn ok(value: Value) -> Self {
        Self {
            value: Some(value),
            error: MetricErrors::OK,
        }
    }
}

/// How one schema field is populated for a dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingRule {
    /// One or more dotted paths into the document, tried in order.
    Ref(Vec<String>),
    /// A static value.
    Value(Value),
    /// A forced error code; the schema default is used as the value.
    Error(MetricErrors),
    /// A registered formula evaluated against the whole document.
    Formula(String),
    /// No recognized mapping property.
    Unmapped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingAttribute {
    pub rule: MappingRule,
    pub required: bool,
}

impl MappingAttribute {
    /// Parse one attribute, applying the `ref > value > error > formula`
    /// precedence when several properties are present.
    pub fn from_json(name: &str, spec: &Value) -> Result<Self, MappingError> {
        let obj = spec
            .as_object()
            .ok_or_else(|| MappingError::NotAnObject(name.to_string()))?;

        if let Some(key) = obj.keys().find(|k| !ATTRIBUTE_KEYS.contains(&k.as_str())) {
            return Err(MappingError::UnknownKey {
                attribute: name.to_string(),
                key: key.clone(),
            });
        }

        let rule = if let Some(r) = obj.get("ref") {
            MappingRule::Ref(parse_ref(name, r)?)
        } else if let Some(v) = obj.get("value") {
            MappingRule::Value(v.clone())
        } else if let Some(e) = obj.get("error") {
            let code = serde_json::from_value::<MetricErrors>(e.clone())
                .map_err(|_| MappingError::InvalidErrorCode(name.to_string()))?;
            MappingRule::Error(code)
        } else if let Some(f) = obj.get("formula") {
            let formula = f
                .as_str()
                .ok_or_else(|| MappingError::InvalidFormula(name.to_string()))?;
            MappingRule::Formula(formula.to_string())
        } else {
            MappingRule::Unmapped
        };

        Ok(Self {
            rule,
            required: obj.get("required").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

fn parse_ref(name: &str, r: &Value) -> Result<Vec<String>, MappingError> {
    let paths = match r {
        Value::String(path) => vec![path.clone()],
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| MappingError::InvalidRef(name.to_string()))?,
        _ => return Err(MappingError::InvalidRef(name.to_string())),
    };
    if paths.is_empty() || paths.iter().any(String::is_empty) {
        return Err(MappingError::InvalidRef(name.to_string()));
    }
    Ok(paths)
}

/// The parsed mapping of one dataset.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    attributes: BTreeMap<String, MappingAttribute>,
}

impl Mapping {
    pub fn from_spec(spec: &BTreeMap<String, Value>) -> Result<Self, MappingError> {
        let attributes = spec
            .iter()
            .map(|(name, attr)| Ok((name.clone(), MappingAttribute::from_json(name, attr)?)))
            .collect::<Result<_, MappingError>>()?;
        Ok(Self { attributes })
    }

    pub fn attributes(&self) -> &BTreeMap<String, MappingAttribute> {
        &self.attributes
    }

    pub fn get(&self, name: &str) -> Option<&MappingAttribute> {
        self.attributes.get(name)
    }

    /// Names of every formula the mapping refers to.
    pub fn formulas(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(name, attr)| match &attr.rule {
            MappingRule::Formula(f) => Some((name.as_str(), f.as_str())),
            _ => None,
        })
    }
}

/// Walk one dotted path. Returns the leaf (if reached) and the deepest
/// `error` annotation seen on the way down.
fn walk<'a>(doc: &'a Value, path: &str) -> (Option<&'a Value>, Option<MetricErrors>) {
    let mut error = None;
    let mut cur = doc;
    for segment in path.split('.') {
        note_error(cur, &mut error);
        let next = match cur {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => cur = v,
            None => return (None, error),
        }
    }
    // An object that only carries an error annotation is not a value.
    if let Value::Object(map) = cur {
        if let Some(code) = map.get("error").and_then(Value::as_u64) {
            error = Some(MetricErrors::from_bits(code as u32));
            return (None, error);
        }
    }
    (Some(cur), error)
}

fn note_error(node: &Value, error: &mut Option<MetricErrors>) {
    if let Some(code) = node.get("error").and_then(Value::as_u64) {
        *error = Some(MetricErrors::from_bits(code as u32));
    }
}

/// Look up the first of `paths` that reaches a value in `doc` and, when
/// `expected` is given, passes type validation.
///
/// When nothing matches, the error is the first annotation seen across all
/// paths, or `metricMissingUnknownReason` if none was seen.
pub fn resolve(doc: &Value, paths: &[String], expected: Option<&FieldType>) -> Resolved {
    let mut first_error: Option<MetricErrors> = None;
    for path in paths {
        let (leaf, error) = walk(doc, path);
        if first_error.is_none() {
            first_error = error;
        }
        let Some(value) = leaf else {
            continue;
        };
        let type_ok = expected.map_or(true, |ty| types::check(value, ty, path).is_valid);
        if type_ok {
            return Resolved {
                value: Some(value.clone()),
                error: error.unwrap_or(MetricErrors::OK),
            };
        }
    }
    Resolved {
        value: None,
        error: first_error.unwrap_or(MetricErrors::MISSING_UNKNOWN_REASON),
    }
}

/// Failure raised by a formula.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FormulaError {
    /// The document did not have the shape the formula expects. The
    /// attribute falls back to its default with a warning.
    #[error("TypeError: {0}")]
    Type(String),
    /// The formula itself is broken. The document is rejected.
    #[error("{0}")]
    Failed(String),
}

/// A formula computes a value (and error code) from the whole document.
/// Returning `value: None` is treated as a broken formula.
pub type FormulaFn = Arc<dyn Fn(&Value) -> Result<Resolved, FormulaError> + Send + Sync>;

/// Named formulas available to dataset mappings.
#[derive(Clone, Default)]
pub struct FormulaRegistry {
    formulas: HashMap<String, FormulaFn>,
}

impl FormulaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, formula: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Resolved, FormulaError> + Send + Sync + 'static,
    {
        self.formulas.insert(name.into(), Arc::new(formula));
        self
    }

    pub fn get(&self, name: &str) -> Option<&FormulaFn> {
        self.formulas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulas.contains_key(name)
    }
}

impl fmt::Debug for FormulaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.formulas.keys().collect();
        names.sort();
        f.debug_struct("FormulaRegistry").field("formulas", &names).finish()
    }
}
