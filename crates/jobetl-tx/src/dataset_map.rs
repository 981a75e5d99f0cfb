//! Binds the schema to one dataset's mapping.

use std::collections::BTreeMap;
use std::sync::Arc;

use jobetl_core::cache::VolatileCache;
use jobetl_core::config::DatasetSpec;
use jobetl_core::mapping::{self, FormulaError, FormulaRegistry, Mapping, MappingError, MappingRule, Resolved};
use jobetl_core::metric_errors::MetricErrors;
use jobetl_core::schema::{Schema, SchemaField};
use jobetl_core::sql;
use jobetl_core::types::{self, FieldType, Severity};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::dynamic_table::{dynamic_tables, DynamicTable};

/// Value and error code of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldValue {
    pub value: Value,
    pub error: MetricErrors,
}

/// Output of [`DatasetMap::transform`].
#[derive(Debug, Clone, Default)]
pub struct TransformedRecord {
    pub data: BTreeMap<String, FieldValue>,
    pub schema: BTreeMap<String, Arc<SchemaField>>,
    /// Fatal problems; the document must not be loaded.
    pub errors: BTreeMap<String, Vec<String>>,
    pub warnings: BTreeMap<String, Vec<String>>,
}

impl TransformedRecord {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Attribute name to value, for binding statement placeholders.
    pub fn values(&self) -> Map<String, Value> {
        self.data
            .iter()
            .map(|(name, fv)| (name.clone(), fv.value.clone()))
            .collect()
    }

    /// `{attribute: {value, error}}` as compared by regression fixtures.
    pub fn data_json(&self) -> Value {
        Value::Object(
            self.data
                .iter()
                .map(|(name, fv)| {
                    let mut entry = Map::new();
                    entry.insert("value".into(), fv.value.clone());
                    entry.insert("error".into(), fv.error.bits().into());
                    (name.clone(), Value::Object(entry))
                })
                .collect(),
        )
    }
}

/// A dataset's mapping validated against the schema.
#[derive(Debug)]
pub struct DatasetMap {
    name: String,
    schema: Arc<Schema>,
    mapping: Mapping,
    fields: BTreeMap<String, Arc<SchemaField>>,
    formulas: FormulaRegistry,
}

impl DatasetMap {
    /// Validate the dataset's mapping: every attribute has a schema field,
    /// only known properties are used and every formula is registered.
    pub fn new(
        schema: Arc<Schema>,
        dataset: &DatasetSpec,
        formulas: FormulaRegistry,
    ) -> Result<Self, MappingError> {
        let mapping = Mapping::from_spec(&dataset.mapping)?;
        let mut fields = BTreeMap::new();
        for name in mapping.attributes().keys() {
            let field = schema
                .field(name)
                .ok_or_else(|| MappingError::NoSchemaField(name.clone()))?;
            fields.insert(name.clone(), field);
        }
        for (attribute, formula) in mapping.formulas() {
            if !formulas.contains(formula) {
                return Err(MappingError::UnknownFormula {
                    attribute: attribute.to_string(),
                    formula: formula.to_string(),
                });
            }
        }
        Ok(Self {
            name: dataset.name.clone(),
            schema,
            mapping,
            fields,
            formulas,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    /// Map one source document onto the schema.
    pub fn transform(&self, doc: &Value) -> TransformedRecord {
        let mut record = TransformedRecord::default();
        for (name, attr) in self.mapping.attributes() {
            let Some(field) = self.fields.get(name) else {
                continue;
            };
            let ty = &field.field_type;
            let mut errors = Vec::new();
            let mut warnings = Vec::new();

            let resolved = match &attr.rule {
                MappingRule::Ref(paths) => Some(ref_default(doc, paths, field)),
                MappingRule::Value(v) => Some(Resolved::ok(v.clone())),
                MappingRule::Error(code) => Some(Resolved {
                    value: Some(field.def.clone()),
                    error: *code,
                }),
                MappingRule::Formula(formula) => {
                    self.apply_formula(formula, doc, field, &mut errors, &mut warnings)
                }
                MappingRule::Unmapped => {
                    errors.push(format!(
                        "Attribute {ty} \"{name}\" does not have a valid mapping property."
                    ));
                    None
                }
            };
            let Resolved {
                mut value,
                mut error,
            } = resolved.unwrap_or(Resolved {
                value: None,
                error: MetricErrors::OK,
            });

            if let Some(v) = value.take().filter(|v| !v.is_null()) {
                let check = types::check(&v, ty, name);
                if check.is_valid {
                    value = Some(types::coerce(v, ty));
                } else {
                    value = Some(field.def.clone());
                    error |= MetricErrors::TYPE_ERROR;
                    if let Some(e) = check.error {
                        match e.severity {
                            Severity::Warning => warnings.push(e.message),
                            Severity::Error => errors.push(e.message),
                        }
                    }
                }
            }

            let value = match value.filter(|v| !v.is_null()) {
                Some(v) => v,
                None => {
                    if (!field.nullable || attr.required) && field.def.is_null() {
                        errors.push(format!(
                            "Attribute {ty} \"{name}\" cannot be null: {{\"value\":null,\"error\":{error}}}"
                        ));
                    }
                    field.def.clone()
                }
            };

            record.schema.insert(name.clone(), field.clone());
            record.data.insert(name.clone(), FieldValue { value, error });
            if !errors.is_empty() {
                record.errors.insert(name.clone(), errors);
            }
            if !warnings.is_empty() {
                record.warnings.insert(name.clone(), warnings);
            }
        }
        record
    }

    fn apply_formula(
        &self,
        formula: &str,
        doc: &Value,
        field: &SchemaField,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Option<Resolved> {
        let ty = &field.field_type;
        let name = &field.name;
        let Some(f) = self.formulas.get(formula) else {
            errors.push(format!(
                "Attribute {ty} \"{name}\" formula \"{formula}\" is not registered."
            ));
            return None;
        };
        match f(doc) {
            Ok(resolved) if resolved.value.is_some() => Some(resolved),
            Ok(resolved) => {
                errors.push(format!(
                    "Attribute {ty} \"{name}\": mapping function must return a value and an error. Returned error {} without a value.",
                    resolved.error
                ));
                None
            }
            Err(FormulaError::Type(msg)) => {
                warnings.push(format!(
                    "Attribute {ty} \"{name}\" mapping function encountered a TypeError exception. The default schema value will be used. Exception: {msg}"
                ));
                Some(Resolved {
                    value: Some(field.def.clone()),
                    error: MetricErrors::MAPPING_FUNCTION_ERROR,
                })
            }
            Err(FormulaError::Failed(msg)) => {
                errors.push(format!(
                    "Attribute {ty} \"{name}\" mapping function encountered an exception: {msg}"
                ));
                None
            }
        }
    }

    /// Dimension rows the record needs, rendered with the record's values.
    /// Cacheable statements already executed on this connection are skipped.
    pub fn dimension_insert_statements(
        &self,
        record: &TransformedRecord,
        cache: &mut VolatileCache,
    ) -> Vec<String> {
        let values = record.values();
        let mut statements = Vec::new();
        for (name, field) in &record.schema {
            for insert in &field.dim_insert {
                let stmt = sql::query_format_map(&insert.query, &values);
                if !insert.cacheable || cache.insert_statement(&stmt) {
                    statements.push(stmt);
                } else {
                    debug!(dataset = %self.name, attribute = %name, "dimension insert cached");
                }
            }
        }
        statements
    }

    /// Dynamic tables this dataset writes to.
    pub fn tables(&self) -> BTreeMap<String, DynamicTable> {
        dynamic_tables(
            &self.schema,
            self.mapping.attributes().keys().map(String::as_str),
        )
    }
}

/// Resolve `paths` for `field`, falling back to the field default.
///
/// A typed lookup is tried first; if nothing matches, the lookup is repeated
/// untyped so that a present but mistyped value still reaches type
/// validation. Numbers found for string fields are converted to strings.
pub fn ref_default(doc: &Value, paths: &[String], field: &SchemaField) -> Resolved {
    let mut resolved = mapping::resolve(doc, paths, Some(&field.field_type));
    if resolved.value.is_none() {
        resolved = mapping::resolve(doc, paths, None);
    }
    if field.field_type == FieldType::String {
        if let Some(Value::Number(n)) = &resolved.value {
            resolved.value = Some(Value::String(n.to_string()));
        }
    }
    if resolved.value.is_none() {
        resolved.value = Some(field.def.clone());
    }
    resolved
}
