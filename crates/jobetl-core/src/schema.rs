//! Target schema: field definitions, table placement and aggregation hints.
//!
//! Field lookup is two-phase. Exact names are looked up first; otherwise the
//! ordered pattern rules are tried and the first match materializes a
//! concrete [`SchemaField`] named after the requested field, with the
//! pattern's capture groups as its `dynamictags`. Materialized fields are
//! memoized by name.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::one_or_many;
use crate::metric_errors::MetricErrors;
use crate::sql;
use crate::types::FieldType;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid field pattern \"{pattern}\": {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("field \"{field}\" refers to unknown table \"{table}\"")]
    UnknownTable { field: String, table: String },
    #[error("aggregation hint of \"{field}\" refers to unknown aggregation table \"{table}\"")]
    UnknownAggregationTable { field: String, table: String },
    #[error("no schema field named \"{0}\"")]
    UnknownField(String),
}

/// One target attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaField {
    /// Filled in from the map key (or the requested name for pattern hits).
    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(default = "default_true")]
    pub nullable: bool,

    /// Default value. `null` means "no default".
    #[serde(default)]
    pub def: Value,

    /// Destination table.
    #[serde(default)]
    pub table: Option<String>,

    /// Width of string columns.
    #[serde(default)]
    pub length: Option<u32>,

    #[serde(default)]
    pub unit: Option<String>,

    #[serde(default)]
    pub per: Option<String>,

    #[serde(default)]
    pub comments: Option<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub agg: Vec<AggSpec>,

    /// Dimension rows to insert before the fact row references them.
    #[serde(default, deserialize_with = "one_or_many")]
    pub dim_insert: Vec<DimInsertSpec>,

    /// Pattern capture groups; tag `i` replaces `:label_i` in text.
    #[serde(default)]
    pub dynamictags: Vec<String>,

    #[serde(default)]
    pub stats: Vec<StatSpec>,

    #[serde(default)]
    pub roles: Option<RoleAccess>,

    /// Human-readable name used in the raw statistics catalog.
    #[serde(default)]
    pub display: Option<String>,

    #[serde(default)]
    pub dtype: Option<String>,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub visibility: Option<String>,

    #[serde(default)]
    pub batch_export: Option<Value>,

    #[serde(default)]
    pub join: Option<JoinSpec>,

    #[serde(default)]
    pub formula: Option<String>,

    #[serde(default)]
    pub with_error: Option<Value>,

    /// Set for derived fields resolved through a lookup query.
    #[serde(skip)]
    pub queried: bool,
}

impl SchemaField {
    /// A non-nullable field without a default. Its error-table column stores
    /// the value itself rather than an error code.
    pub fn is_required_dimension(&self) -> bool {
        !self.nullable && self.def.is_null()
    }

    pub fn sql_type(&self) -> Result<String, sql::SqlTypeError> {
        sql::sql_type(&self.field_type, self.length)
    }

    /// Apply `:label_N` / `:Label_N` substitution from the dynamic tags.
    pub fn substitute_tags(&self, text: &str) -> String {
        substitute_tags(text, &self.dynamictags)
    }
}

/// Replace `:label_N` with tag `N` and `:Label_N` with its capitalized form.
pub fn substitute_tags(text: &str, tags: &[String]) -> String {
    let mut out = text.to_string();
    for (idx, tag) in tags.iter().enumerate() {
        out = out.replace(&format!(":label_{idx}"), tag);
        out = out.replace(&format!(":Label_{idx}"), &word_to_upper(tag));
    }
    out
}

/// Capitalize the first letter of every whitespace separated word.
pub fn word_to_upper(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimInsertSpec {
    /// Statement template with `:field` placeholders.
    pub query: String,
    #[serde(default = "default_true")]
    pub cacheable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleAccess {
    /// Roles for which the group-by is disabled.
    #[serde(default)]
    pub disable: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSpec {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
}

/// How a field contributes to an aggregation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggSpec {
    pub table: String,
    /// Column name; `:field_name` is replaced by the source field name.
    #[serde(default)]
    pub name: Option<String>,
    /// Group-by identifier, or a list of identifiers sharing the column.
    #[serde(default)]
    pub alias: Option<Value>,
    #[serde(rename = "type", default)]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub nullable: Option<bool>,
    #[serde(default)]
    pub def: Option<Value>,
    #[serde(default)]
    pub dimension: bool,
    #[serde(default)]
    pub dimension_table: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub roles: Option<RoleAccess>,
    #[serde(default)]
    pub stats: Option<Vec<StatSpec>>,
    #[serde(default)]
    pub dynamictags: Option<Vec<String>>,
    /// Source expression; `:field_name` is replaced by the source field name.
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub show_all_dimension_values: bool,
}

/// A statistic exposed by the analytics engine for an aggregation column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub aggregate_sql: Option<String>,
    #[serde(default)]
    pub timeseries_sql: Option<String>,
    #[serde(default)]
    pub requirenotnull: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableDefinition {
    #[default]
    Dynamic,
    Static,
}

/// Table metadata shared by fact, dimension and aggregation tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    /// Database (schema) name.
    pub schema: String,
    #[serde(default)]
    pub definition: TableDefinition,
    /// Columns of the unique key.
    #[serde(default)]
    pub unique: Vec<String>,
    /// Extra column or key definitions appended to the DDL.
    #[serde(default)]
    pub extras: Vec<String>,
    /// Trigger bodies keyed by `before_insert`, `after_update`, `before_del`, ...
    #[serde(default)]
    pub triggers: BTreeMap<String, String>,
    /// Realm this table feeds in the analytics engine.
    #[serde(default)]
    pub realm_name: Option<String>,
    /// Statement populating a static dimension table.
    #[serde(default)]
    pub import_stmt: Option<String>,
    /// Extra columns of an aggregation table.
    #[serde(default)]
    pub fields: BTreeMap<String, SchemaField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternFieldSpec {
    pub pattern: String,
    pub field: SchemaField,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedFieldSpec {
    #[serde(flatten)]
    pub field: SchemaField,
    /// Lookup query; placeholders are bound from the transformed record.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub cacheable: bool,
    /// Literal value; no lookup is made.
    #[serde(default)]
    pub value: Option<Value>,
}

/// Raw statistics table joined into the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTableSpec {
    pub schema: String,
    pub name: String,
    pub alias: String,
    pub join: RawJoinSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawJoinSpec {
    pub primary_key: String,
    pub foreign_table_alias: String,
    pub foreign_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStatisticsSpec {
    #[serde(default)]
    pub realm_name: String,
    #[serde(default)]
    pub realm_display: String,
    #[serde(default)]
    pub realm_order: u32,
    /// `schema.table` whose columns are listed in the catalog.
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub tables: Vec<RawTableSpec>,
    #[serde(default)]
    pub fields: BTreeMap<String, SchemaField>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EtlLoggingSpec {
    /// Field whose min/max over inserted rows is recorded in the run log.
    #[serde(default)]
    pub index_field: Option<String>,
    /// Static values added to every run log row.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSpec {
    #[serde(default)]
    pub tables: BTreeMap<String, TableSpec>,
    #[serde(default)]
    pub dimension_tables: BTreeMap<String, TableSpec>,
    #[serde(default)]
    pub aggregation_tables: BTreeMap<String, TableSpec>,
    #[serde(default)]
    pub fields: BTreeMap<String, SchemaField>,
    #[serde(default)]
    pub patterns: Vec<PatternFieldSpec>,
    #[serde(default)]
    pub derived_fields: BTreeMap<String, DerivedFieldSpec>,
    #[serde(default)]
    pub raw_statistics: Option<RawStatisticsSpec>,
    #[serde(default)]
    pub etl_logging: Option<EtlLoggingSpec>,
    #[serde(default)]
    pub group_by_none_roles: Option<RoleAccess>,
}

/// Run-time state of one derived field for one document.
#[derive(Debug, Clone)]
pub struct DerivedField {
    pub schema_field: Arc<SchemaField>,
    /// Lookup query with the record's values bound.
    pub query: Option<String>,
    pub cacheable: bool,
    /// `None` until a literal or a lookup row provides a value.
    pub value: Option<Value>,
    pub error: MetricErrors,
}

/// Compiled schema.
#[derive(Debug)]
pub struct Schema {
    spec: SchemaSpec,
    fields: HashMap<String, Arc<SchemaField>>,
    patterns: Vec<(Regex, SchemaField)>,
    derived: BTreeMap<String, Arc<SchemaField>>,
    materialized: RwLock<HashMap<String, Arc<SchemaField>>>,
}

impl Schema {
    pub fn new(mut spec: SchemaSpec) -> Result<Self, SchemaError> {
        for (name, field) in spec.fields.iter_mut() {
            field.name = name.clone();
        }
        for (name, derived) in spec.derived_fields.iter_mut() {
            derived.field.name = name.clone();
            derived.field.queried = derived.query.is_some();
        }
        for table in spec.aggregation_tables.values_mut() {
            for (name, field) in table.fields.iter_mut() {
                field.name = name.clone();
            }
        }

        let named = spec
            .fields
            .values()
            .chain(spec.derived_fields.values().map(|d| &d.field))
            .chain(spec.patterns.iter().map(|p| &p.field));
        for field in named {
            check_tables(&spec, field)?;
        }

        let patterns = spec
            .patterns
            .iter()
            .map(|p| {
                Regex::new(&p.pattern)
                    .map(|re| (re, p.field.clone()))
                    .map_err(|source| SchemaError::InvalidPattern {
                        pattern: p.pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let fields = spec
            .fields
            .iter()
            .map(|(name, field)| (name.clone(), Arc::new(field.clone())))
            .collect();
        let derived = spec
            .derived_fields
            .iter()
            .map(|(name, d)| (name.clone(), Arc::new(d.field.clone())))
            .collect();

        Ok(Self {
            spec,
            fields,
            patterns,
            derived,
            materialized: RwLock::new(HashMap::new()),
        })
    }

    pub fn spec(&self) -> &SchemaSpec {
        &self.spec
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.spec.tables.get(name)
    }

    pub fn aggregation_table(&self, name: &str) -> Option<&TableSpec> {
        self.spec.aggregation_tables.get(name)
    }

    /// Resolve a mapped field by exact name, then by pattern.
    pub fn field(&self, name: &str) -> Option<Arc<SchemaField>> {
        if let Some(field) = self.fields.get(name) {
            return Some(field.clone());
        }
        if let Some(field) = self.read_materialized(name) {
            return Some(field);
        }
        let (re, template) = self.patterns.iter().find(|(re, _)| re.is_match(name))?;
        let caps = re.captures(name)?;
        let mut field = template.clone();
        field.name = name.to_string();
        field.dynamictags = caps
            .iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect();
        let field = Arc::new(field);
        let mut cache = self
            .materialized
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(cache.entry(name.to_string()).or_insert(field).clone())
    }

    fn read_materialized(&self, name: &str) -> Option<Arc<SchemaField>> {
        self.materialized
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn derived_field(&self, name: &str) -> Option<Arc<SchemaField>> {
        self.derived.get(name).cloned()
    }

    /// Mapped field or, failing that, derived field.
    pub fn field_or_derived(&self, name: &str) -> Option<Arc<SchemaField>> {
        self.field(name).or_else(|| self.derived_field(name))
    }

    pub fn derived_names(&self) -> impl Iterator<Item = &str> {
        self.derived.keys().map(String::as_str)
    }

    /// Plan the derived fields for one record, binding each lookup query to
    /// the record's `values`.
    pub fn derived_fields(&self, values: &Map<String, Value>) -> BTreeMap<String, DerivedField> {
        self.spec
            .derived_fields
            .iter()
            .filter_map(|(name, spec)| {
                let schema_field = self.derived.get(name)?.clone();
                Some((
                    name.clone(),
                    DerivedField {
                        schema_field,
                        query: spec
                            .query
                            .as_deref()
                            .map(|q| sql::query_format_map(q, values)),
                        cacheable: spec.cacheable,
                        value: spec.value.clone(),
                        error: MetricErrors::OK,
                    },
                ))
            })
            .collect()
    }
}

fn check_tables(spec: &SchemaSpec, field: &SchemaField) -> Result<(), SchemaError> {
    if let Some(table) = &field.table {
        if !spec.tables.contains_key(table) && !spec.dimension_tables.contains_key(table) {
            return Err(SchemaError::UnknownTable {
                field: field.name.clone(),
                table: table.clone(),
            });
        }
    }
    for agg in &field.agg {
        if !spec.aggregation_tables.contains_key(&agg.table) {
            return Err(SchemaError::UnknownAggregationTable {
                field: field.name.clone(),
                table: agg.table.clone(),
            });
        }
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_decimals() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        let spec: SchemaSpec = serde_yaml::from_str(
            r#"
tables:
  jobfact: { schema: modw_supremm, unique: [resource_id, local_job_id] }
aggregation_tables:
  jobfact_agg: { schema: modw_aggregates, realm_name: SUPREMM }
fields:
  cpu_time: { type: double, nullable: false, table: jobfact, agg: { table: jobfact_agg } }
  local_job_id: { type: uint32, nullable: false, table: jobfact }
patterns:
  - pattern: "^(\\w+?)_(read|write)_bytes$"
    field: { type: double, table: jobfact, comments: ":Label_0 :label_1 rate" }
derived_fields:
  resource_id:
    type: int32
    nullable: false
    table: jobfact
    query: "SELECT id AS resource_id FROM resources WHERE code = :resource"
    cacheable: true
  shared: { type: tinyint, table: jobfact, value: 0 }
"#,
        )
        .unwrap();
        Schema::new(spec).unwrap()
    }

    #[test]
    fn exact_lookup_fills_in_the_name() {
        let s = schema();
        let f = s.field("cpu_time").unwrap();
        assert_eq!(f.name, "cpu_time");
        assert!(f.is_required_dimension());
        assert_eq!(f.agg.len(), 1);
        assert!(s.field("nothing").is_none());
    }

    #[test]
    fn pattern_hit_materializes_once() {
        let s = schema();
        let first = s.field("lustre_read_bytes").unwrap();
        assert_eq!(first.name, "lustre_read_bytes");
        assert_eq!(first.dynamictags, vec!["lustre", "read"]);
        assert_eq!(
            first.substitute_tags(first.comments.as_deref().unwrap()),
            "Lustre read rate"
        );
        let again = s.field("lustre_read_bytes").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn derived_fields_bind_record_values() {
        let s = schema();
        let values = json!({"resource": "frank"});
        let derived = s.derived_fields(values.as_object().unwrap());
        let rid = &derived["resource_id"];
        assert_eq!(
            rid.query.as_deref(),
            Some("SELECT id AS resource_id FROM resources WHERE code = 'frank'")
        );
        assert!(rid.cacheable);
        assert!(rid.value.is_none());
        assert!(rid.schema_field.queried);
        assert_eq!(derived["shared"].value, Some(json!(0)));
        assert!(s.field("resource_id").is_none());
        assert!(s.field_or_derived("resource_id").is_some());
    }

    #[test]
    fn unknown_table_is_rejected() {
        let spec: SchemaSpec =
            serde_yaml::from_str("fields:\n  x: { type: int32, table: nowhere }\n").unwrap();
        assert!(matches!(
            Schema::new(spec),
            Err(SchemaError::UnknownTable { .. })
        ));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let spec: SchemaSpec =
            serde_yaml::from_str("patterns:\n  - pattern: \"(\"\n    field: { type: int32 }\n")
                .unwrap();
        assert!(matches!(
            Schema::new(spec),
            Err(SchemaError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn word_to_upper_capitalizes_each_word() {
        assert_eq!(word_to_upper("cpu user time"), "Cpu User Time");
        assert_eq!(word_to_upper(""), "");
    }
}
