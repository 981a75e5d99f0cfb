//! Analytics engine configuration generated from the aggregation tables.
//!
//! For each aggregation table's realm this writes:
//!
//! * `<realm>config.json` with the ETL profile version,
//! * `datawarehouse.d/ref/<realm>-group-bys.json` and `<realm>-statistics.json`,
//! * `roles.d/<realm>.json` listing the realm's group-bys per role,
//! * optionally one templated source file per group-by and statistic.
//!
//! The raw statistics catalog (`rawstatistics.d/<order>_<realm>.json`) is
//! written once from the schema's raw statistics configuration.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jobetl_core::schema::{substitute_tags, RawJoinSpec, RawStatisticsSpec, RawTableSpec, RoleAccess};
use jobetl_core::sorting;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::aggregation::{AggregationColumn, AggregationTable};
use crate::dynamic_table::{DynamicTable, TableError};
use crate::etlv2::write_json;

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("statistic \"{statistic}\" of column \"{column}\" has neither sql nor aggregate_sql and timeseries_sql")]
    MissingStatisticSql { column: String, statistic: String },
}

/// Where integration inputs are read and outputs written.
#[derive(Debug, Clone)]
pub struct IntegrationPaths {
    /// Profile root; group-by includes are read from `output_db/groupbys*.json`.
    pub root: PathBuf,
    /// Directory holding the analytics engine's `roles.json`.
    pub config_dir: PathBuf,
    /// Directory generated configuration is written to.
    pub build_dir: PathBuf,
}

impl IntegrationPaths {
    /// Read and write everything under `root`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_dir: root.clone(),
            build_dir: root.clone(),
            root,
        }
    }
}

/// A text template and the extension of the files rendered from it.
#[derive(Debug, Clone)]
pub struct SourceTemplate {
    pub text: String,
    pub extension: String,
}

impl SourceTemplate {
    /// Load a template. `GroupBy.php.template` renders `.php` files,
    /// `GroupBy.py` renders `.py` files.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading template {}", path.display()))?;
        let stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .trim_end_matches(".template");
        let extension = Path::new(stem)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("txt")
            .to_string();
        Ok(Self { text, extension })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceTemplates {
    pub group_by: Option<SourceTemplate>,
    pub statistic: Option<SourceTemplate>,
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("static placeholder pattern")
});

/// Replace `{{name}}` with `vars[name]`; unknown names are left in place.
pub fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            vars.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Capitalize the first letter and drop underscores, capitalizing the letter
/// after each (optionally preceded by a space).
pub fn camel_case(input: &str, insert_spaces: bool) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    if let Some(first) = chars.next() {
        out.extend(first.to_uppercase());
    }
    while let Some(c) = chars.next() {
        if c == '_' {
            if let Some(next) = chars.next() {
                if insert_spaces {
                    out.push(' ');
                }
                out.extend(next.to_uppercase());
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Human friendly name for a column: `resource_id` becomes `Resource`,
/// `job_id` stays `Job Id`.
pub fn namealize(input: &str) -> String {
    let trimmed = match input.strip_suffix("_id") {
        Some(stripped) if !input.ends_with("job_id") => stripped,
        _ => input,
    };
    camel_case(trimmed, true)
}

/// Group-by definition for one item of a dimension column.
pub fn generate_group_by(item_alias: &str, column: &AggregationColumn, label: Option<&str>) -> Value {
    let tags = &column.dynamictags;
    let label = label
        .or(column.label.as_deref())
        .map(|l| substitute_tags(l, tags))
        .filter(|l| !l.is_empty());
    json!({
        "attribute_table_schema": "modw_supremm",
        "attribute_to_aggregate_table_key_map": [{ "id": column.name }],
        "attribute_values_query": {
            "joins": [{ "name": column.dimension_table }],
            "orderby": ["id"],
            "records": {
                "id": "id",
                "name": "description",
                "order_id": "id",
                "short_name": "description",
            },
        },
        "category": column.category.as_deref().unwrap_or("unknown"),
        "chart_options": {
            "combine_method": "stack",
            "dataset_display_type": { "aggregate": "bar" },
            "dataset_type": "aggregate",
        },
        "data_sort_order": null,
        "description_html": substitute_tags(&column.comments, tags),
        "name": label.unwrap_or_else(|| item_alias.to_string()),
        "show_all_dimension_values": column.show_all_dimension_values,
    })
}

/// Statistic definitions contributed by one column, keyed by statistic id.
pub fn column_statistics(column: &AggregationColumn) -> Result<Vec<(String, Value)>, IntegrationError> {
    let field_name = column.name.as_str();
    let tags = &column.dynamictags;
    let mut out = Vec::new();
    for stat in &column.stats {
        let id = stat
            .name
            .as_deref()
            .map_or_else(|| field_name.to_string(), |n| n.replacen(":field_name", field_name, 1));
        let label = substitute_tags(&stat.label.replacen(":field_name", field_name, 1), tags);
        let description = stat
            .description
            .as_deref()
            .map(|d| substitute_tags(&d.replacen(":field_name", field_name, 1), tags));

        let (aggregate, timeseries) = match (&stat.sql, &stat.aggregate_sql, &stat.timeseries_sql) {
            (Some(sql), _, _) => {
                let formula = sql.replace(":field_name", field_name);
                (formula.clone(), formula)
            }
            (None, Some(agg), Some(ts)) => (
                agg.replace(":field_name", field_name),
                ts.replace(":field_name", field_name),
            ),
            _ => {
                return Err(IntegrationError::MissingStatisticSql {
                    column: field_name.to_string(),
                    statistic: id,
                })
            }
        };

        let mut def = Map::new();
        def.insert("aggregate_formula".into(), aggregate.into());
        if let Some(description) = description {
            def.insert("description_html".into(), description.into());
        }
        def.insert("name".into(), label.into());
        def.insert("precision".into(), stat.decimals.into());
        def.insert("timeseries_formula".into(), timeseries.into());
        if let Some(unit) = &stat.unit {
            def.insert("unit".into(), unit.clone().into());
        }
        if stat.requirenotnull {
            def.insert(
                "additional_where_condition".into(),
                json!([field_name, "IS NOT", "NULL"]),
            );
        }
        out.push((id, Value::Object(def)));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleEntry {
    pub group_by: String,
    pub access: Option<RoleAccess>,
}

/// Everything generated for one aggregation table's realm.
#[derive(Debug, Clone)]
pub struct RealmIntegration {
    pub realm: String,
    pub group_bys: Map<String, Value>,
    pub statistics: Map<String, Value>,
    pub roles: Vec<RoleEntry>,
}

impl RealmIntegration {
    /// Build the realm's group-bys, statistics and role entries. `includes`
    /// seeds the group-by map.
    pub fn build(
        table: &AggregationTable,
        none_roles: Option<&RoleAccess>,
        includes: Map<String, Value>,
    ) -> Result<Self, IntegrationError> {
        let mut integration = Self {
            realm: table.realm()?.to_string(),
            group_bys: includes,
            statistics: Map::new(),
            roles: Vec::new(),
        };
        integration.add_role("none", none_roles);

        for column in table.fields() {
            if column.label.is_some() {
                let alias = column
                    .alias
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or(&column.name)
                    .to_string();
                integration.add_role(&alias, column.roles.as_ref());
                let group_by = generate_group_by(&alias, column, None);
                integration.group_bys.insert(alias, group_by);
            } else if column.dimension {
                for item in dimension_items(column) {
                    if column.dimension_table.is_some() {
                        let label = camel_case(&item, false);
                        let group_by = generate_group_by(&item, column, Some(&label));
                        integration.group_bys.insert(item.clone(), group_by);
                    }
                    integration.add_role(&item, column.roles.as_ref());
                }
            }

            for (id, stat) in column_statistics(column)? {
                integration.statistics.insert(id, stat);
            }
        }
        Ok(integration)
    }

    fn add_role(&mut self, group_by: &str, access: Option<&RoleAccess>) {
        self.roles.push(RoleEntry {
            group_by: group_by.to_string(),
            access: access.cloned(),
        });
    }

    /// Role entries with `none` first, the rest by group-by name.
    pub fn sorted_roles(&self) -> Vec<&RoleEntry> {
        let mut roles: Vec<_> = self.roles.iter().collect();
        roles.sort_by(|a, b| match (a.group_by == "none", b.group_by == "none") {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            (false, false) => a.group_by.cmp(&b.group_by),
        });
        roles
    }

    /// Query descriptors for `role`, flagging group-bys the role may not use.
    pub fn query_descriptors(&self, role: &str) -> Vec<Value> {
        self.sorted_roles()
            .into_iter()
            .map(|entry| {
                let mut desc = Map::new();
                desc.insert("realm".into(), self.realm.clone().into());
                desc.insert("group_by".into(), entry.group_by.clone().into());
                let disabled = entry
                    .access
                    .as_ref()
                    .is_some_and(|a| a.disable.iter().any(|r| r == role));
                if disabled {
                    desc.insert("disable".into(), true.into());
                }
                Value::Object(desc)
            })
            .collect()
    }

    /// `roles.d` document for every role of `roles_config` that has query
    /// descriptors.
    pub fn role_document(&self, roles_config: &Value) -> Value {
        let mut roles = Map::new();
        if let Some(defined) = roles_config.get("roles").and_then(Value::as_object) {
            for (role, def) in defined {
                if def.get("query_descripters").is_some() {
                    roles.insert(
                        format!("+{role}"),
                        json!({ "+query_descripters": self.query_descriptors(role) }),
                    );
                }
            }
        }
        json!({ "+roles": roles })
    }
}

/// Group-by identifiers of a dimension column: its alias (or list of
/// aliases), otherwise the column name without an `_id` suffix.
fn dimension_items(column: &AggregationColumn) -> Vec<String> {
    match &column.alias {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(alias)) => vec![alias.clone()],
        _ => vec![column
            .name
            .strip_suffix("_id")
            .unwrap_or(&column.name)
            .to_string()],
    }
}

/// Merge every `output_db/groupbys*.json` under `root`, in file name order.
pub fn read_group_by_includes(root: &Path) -> Result<Map<String, Value>> {
    let pattern = root.join("output_db").join("groupbys*.json");
    let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .context("group-by include pattern")?
        .filter_map(|entry| entry.ok())
        .collect();
    files.sort();
    let mut merged = Map::new();
    for file in files {
        let text = fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
        let value: Map<String, Value> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
        debug!(file = %file.display(), entries = value.len(), "group-by include");
        merged.extend(value);
    }
    Ok(merged)
}

/// Raw statistics configuration with the fact table's columns merged in.
pub fn raw_statistics_configuration(
    spec: Option<&RawStatisticsSpec>,
    tables: &BTreeMap<String, DynamicTable>,
) -> Option<RawStatisticsSpec> {
    let mut config = spec?.clone();
    for table in tables.values() {
        if table.qualified_name() == config.table {
            for (name, column) in &table.columns {
                config.fields.insert(name.clone(), (**column).clone());
            }
        }
    }
    Some(config)
}

/// Raw statistics catalog document for `config`.
pub fn raw_statistics_catalog(config: &RawStatisticsSpec) -> Value {
    let mut tables = config.tables.clone();
    let mut aliases: HashMap<(String, String, String, String), String> = tables
        .iter()
        .map(|t| {
            (
                (t.schema.clone(), t.name.clone(), t.join.foreign_table_alias.clone(), t.join.foreign_key.clone()),
                t.alias.clone(),
            )
        })
        .collect();
    let mut next_alias = 1;
    let mut fields = Vec::new();

    for (key, col) in &config.fields {
        let dtype = col
            .dtype
            .clone()
            .unwrap_or_else(|| (if col.queried { "foreignkey" } else { "statistic" }).to_string());
        let name = col
            .display
            .as_deref()
            .map(|d| col.substitute_tags(d))
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| namealize(key));
        let mut alias = key.clone();
        let mut column_name = key.clone();
        let mut table_alias = "jf".to_string();

        if dtype == "foreignkey" {
            let Some(join) = &col.join else {
                debug!(field = %key, "foreign key without join skipped");
                continue;
            };
            let foreign_key = join.foreign_key.clone().unwrap_or_else(|| key.clone());
            alias = name.clone();
            column_name = join.column.clone().unwrap_or_else(|| "name".to_string());
            let alias_key = (join.schema.clone(), join.table.clone(), "jf".to_string(), foreign_key.clone());
            table_alias = match aliases.get(&alias_key) {
                Some(existing) => existing.clone(),
                None => {
                    let fresh = format!("ft{next_alias}");
                    next_alias += 1;
                    tables.push(RawTableSpec {
                        schema: join.schema.clone(),
                        name: join.table.clone(),
                        alias: fresh.clone(),
                        join: RawJoinSpec {
                            primary_key: "id".to_string(),
                            foreign_table_alias: "jf".to_string(),
                            foreign_key,
                        },
                    });
                    aliases.insert(alias_key, fresh.clone());
                    fresh
                }
            };
        }

        let mut def = Map::new();
        def.insert("key".into(), key.clone().into());
        def.insert("alias".into(), alias.into());
        def.insert("name".into(), name.into());
        def.insert("dtype".into(), dtype.into());
        if let Some(unit) = &col.unit {
            def.insert("units".into(), unit.clone().into());
        }
        if let Some(per) = &col.per {
            def.insert("per".into(), per.clone().into());
        }
        if let Some(comments) = &col.comments {
            def.insert("documentation".into(), comments.clone().into());
        }
        def.insert(
            "visibility".into(),
            col.visibility.clone().unwrap_or_else(|| "public".into()).into(),
        );
        def.insert(
            "batchExport".into(),
            col.batch_export.clone().filter(truthy).unwrap_or(Value::Bool(false)),
        );
        def.insert(
            "group".into(),
            col.group.clone().unwrap_or_else(|| "misc".into()).into(),
        );
        match &col.formula {
            Some(formula) => {
                def.insert("formula".into(), formula.clone().into());
            }
            None => {
                def.insert("column".into(), column_name.into());
                def.insert("tableAlias".into(), table_alias.into());
            }
        }
        if let Some(with_error) = col.with_error.clone().filter(truthy) {
            def.insert("withError".into(), with_error);
        }
        fields.push(Value::Object(def));
    }

    sorting::sort_by_keys(&mut fields, &["dtype", "group", "units", "name"]);

    let mut catalog = Map::new();
    catalog.insert(
        "+realms".into(),
        json!([{ "name": config.realm_name, "display": config.realm_display }]),
    );
    catalog.insert(config.realm_name.clone(), json!({ "tables": tables, "fields": fields }));
    Value::Object(catalog)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Inputs of one integration run.
#[derive(Debug)]
pub struct Integration<'a> {
    pub aggregation_tables: &'a BTreeMap<String, AggregationTable>,
    pub raw_statistics: Option<RawStatisticsSpec>,
    pub group_by_none_roles: Option<&'a RoleAccess>,
    pub version: &'a str,
    pub paths: &'a IntegrationPaths,
    pub templates: &'a SourceTemplates,
}

impl Integration<'_> {
    /// Write every integration artifact; returns the written paths.
    pub fn run(&self) -> Result<Vec<PathBuf>> {
        let build = &self.paths.build_dir;
        let mut written = Vec::new();

        for table in self.aggregation_tables.values() {
            info!(table = %format!("{}.{}", table.meta.schema, table.name), "processing table");
            let includes = read_group_by_includes(&self.paths.root)?;
            let realm = RealmIntegration::build(table, self.group_by_none_roles, includes)?;
            let lower = realm.realm.to_lowercase();

            written.push(write_json(build, &format!("{lower}config"), &json!({ "etlversion": self.version }))?);

            let ref_dir = build.join("datawarehouse.d").join("ref");
            written.push(write_json(
                &ref_dir,
                &format!("{lower}-statistics"),
                &Value::Object(realm.statistics.clone()),
            )?);
            written.push(write_json(
                &ref_dir,
                &format!("{lower}-group-bys"),
                &Value::Object(realm.group_bys.clone()),
            )?);

            let roles_path = self.paths.config_dir.join("roles.json");
            let roles_text = fs::read_to_string(&roles_path)
                .with_context(|| format!("reading {}", roles_path.display()))?;
            let roles_config: Value = serde_json::from_str(&roles_text)
                .with_context(|| format!("parsing {}", roles_path.display()))?;
            written.push(write_json(&build.join("roles.d"), &lower, &realm.role_document(&roles_config))?);

            written.extend(self.render_sources(&realm)?);
        }

        if let Some(config) = &self.raw_statistics {
            let stem = format!("{}_{}", config.realm_order, config.realm_name.to_lowercase());
            written.push(write_json(
                &build.join("rawstatistics.d"),
                &stem,
                &raw_statistics_catalog(config),
            )?);
        }
        Ok(written)
    }

    fn render_sources(&self, realm: &RealmIntegration) -> Result<Vec<PathBuf>> {
        let dir = self.paths.build_dir.join("sources").join(realm.realm.to_lowercase());
        let mut written = Vec::new();
        if let Some(template) = &self.templates.group_by {
            for (id, group_by) in &realm.group_bys {
                let mut vars = BTreeMap::new();
                vars.insert("realm", realm.realm.clone());
                vars.insert("id", id.clone());
                vars.insert("class", camel_case(id, false));
                for key in ["name", "description_html", "category"] {
                    vars.insert(key, text_of(group_by.get(key)));
                }
                vars.insert("column", text_of(group_by.pointer("/attribute_to_aggregate_table_key_map/0/id")));
                vars.insert("dimension_table", text_of(group_by.pointer("/attribute_values_query/joins/0/name")));
                written.push(write_source(&dir.join("group_bys"), &vars, template)?);
            }
        }
        if let Some(template) = &self.templates.statistic {
            for (id, stat) in &realm.statistics {
                let mut vars = BTreeMap::new();
                vars.insert("realm", realm.realm.clone());
                vars.insert("id", id.clone());
                vars.insert("class", camel_case(id, false));
                for key in ["name", "description_html", "unit", "precision", "aggregate_formula", "timeseries_formula"] {
                    vars.insert(key, text_of(stat.get(key)));
                }
                written.push(write_source(&dir.join("statistics"), &vars, template)?);
            }
        }
        Ok(written)
    }
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn write_source(dir: &Path, vars: &BTreeMap<&str, String>, template: &SourceTemplate) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let class = vars.get("class").map(String::as_str).unwrap_or("Generated");
    let path = dir.join(format!("{class}.{}", template.extension));
    fs::write(&path, render_template(&template.text, vars))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::aggregation_tables;
    use jobetl_core::schema::{Schema, SchemaSpec};

    const SCHEMA: &str = r#"
tables:
  job: { schema: modw_supremm, unique: [resource_id, local_job_id] }
aggregation_tables:
  supremm:
    schema: modw_aggregates
    realm_name: SUPREMM
fields:
  resource_id:
    type: int32
    nullable: false
    table: job
    comments: "The resource that ran the job"
    unit: ""
    roles: { disable: [pub] }
    agg:
      table: supremm
      name: record_resource_id
      dimension: true
      dimension_table: resourcefact
      alias: [resource, provider]
      sql: "jf.resource_id"
  queue:
    type: string
    nullable: false
    table: job
    comments: "Queue"
    agg: { table: supremm, dimension: true, label: "Queue", category: Administrative, sql: "jf.queue" }
  cpu_user:
    type: double
    table: job
    agg:
      table: supremm
      name: cpu_user
      sql: "SUM(jf.cpu_user)"
      stats:
        - name: avg_:field_name
          label: "CPU User: :field_name"
          description: "Average :field_name"
          unit: "%"
          decimals: 2
          sql: "100.0 * SUM(:field_name) / SUM(:field_name + 1)"
          requirenotnull: true
        - label: "Timed"
          aggregate_sql: "AVG(:field_name)"
          timeseries_sql: "AVG(:field_name) * :field_name"
"#;

    fn table() -> AggregationTable {
        let spec: SchemaSpec = serde_yaml::from_str(SCHEMA).unwrap();
        let schema = Schema::new(spec).unwrap();
        aggregation_tables(&schema, ["resource_id", "queue", "cpu_user"])
            .unwrap()
            .remove("supremm")
            .unwrap()
    }

    #[test]
    fn names_are_humanized() {
        assert_eq!(camel_case("cpu_user", false), "CpuUser");
        assert_eq!(camel_case("cpu_user", true), "Cpu User");
        assert_eq!(namealize("resource_id"), "Resource");
        assert_eq!(namealize("local_job_id"), "Local Job Id");
        assert_eq!(namealize("wall_time"), "Wall Time");
    }

    #[test]
    fn templates_substitute_known_placeholders() {
        let mut vars = BTreeMap::new();
        vars.insert("class", "Queue".to_string());
        assert_eq!(
            render_template("class GroupBy{{class}} {{ class }} {{other}}", &vars),
            "class GroupByQueue Queue {{other}}"
        );
    }

    #[test]
    fn group_bys_and_roles() {
        let realm = RealmIntegration::build(&table(), None, Map::new()).unwrap();
        let names: Vec<&str> = realm.group_bys.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["queue", "resource", "provider"]);

        let resource = &realm.group_bys["resource"];
        assert_eq!(resource["name"], "Resource");
        assert_eq!(resource["attribute_to_aggregate_table_key_map"][0]["id"], "record_resource_id");
        assert_eq!(resource["attribute_values_query"]["joins"][0]["name"], "resourcefact");
        assert_eq!(resource["category"], "unknown");

        let queue = &realm.group_bys["queue"];
        assert_eq!(queue["name"], "Queue");
        assert_eq!(queue["category"], "Administrative");

        let order: Vec<&str> = realm.sorted_roles().iter().map(|r| r.group_by.as_str()).collect();
        assert_eq!(order, vec!["none", "provider", "queue", "resource"]);

        let descs = realm.query_descriptors("pub");
        assert_eq!(descs[0], json!({"realm": "SUPREMM", "group_by": "none"}));
        assert_eq!(descs[1]["disable"], true);
        assert!(descs[2].get("disable").is_none());

        let doc = realm.role_document(&json!({
            "roles": {
                "pub": {"query_descripters": []},
                "mgr": {"permitted_modules": []},
            }
        }));
        assert!(doc["+roles"].get("+mgr").is_none());
        assert_eq!(doc["+roles"]["+pub"]["+query_descripters"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn statistics_substitute_field_name() {
        let realm = RealmIntegration::build(&table(), None, Map::new()).unwrap();
        let avg = &realm.statistics["avg_cpu_user"];
        assert_eq!(avg["name"], "CPU User: cpu_user");
        assert_eq!(avg["description_html"], "Average cpu_user");
        assert_eq!(avg["precision"], 2);
        assert_eq!(avg["aggregate_formula"], "100.0 * SUM(cpu_user) / SUM(cpu_user + 1)");
        assert_eq!(avg["additional_where_condition"], json!(["cpu_user", "IS NOT", "NULL"]));

        let timed = &realm.statistics["cpu_user"];
        assert_eq!(timed["aggregate_formula"], "AVG(cpu_user)");
        assert_eq!(timed["timeseries_formula"], "AVG(cpu_user) * cpu_user");
        assert_eq!(timed["precision"], 1);
        assert!(timed.get("additional_where_condition").is_none());
    }

    #[test]
    fn includes_seed_group_bys() {
        let mut includes = Map::new();
        includes.insert("person".into(), json!({"name": "User"}));
        let realm = RealmIntegration::build(&table(), None, includes).unwrap();
        assert_eq!(realm.group_bys["person"]["name"], "User");
    }

    #[test]
    fn raw_catalog_joins_foreign_keys() {
        let config: RawStatisticsSpec = serde_yaml::from_str(
            r#"
realm_name: SUPREMM
realm_display: "SUPReMM"
realm_order: 50
table: modw_supremm.job
fields:
  resource_id:
    type: int32
    dtype: foreignkey
    group: Administration
    join: { schema: modw, table: resourcefact, column: code }
  person_id:
    type: int32
    dtype: foreignkey
    group: Administration
    display: "User"
    join: { schema: modw, table: person, column: long_name }
  pi_person_id:
    type: int32
    dtype: foreignkey
    join: { schema: modw, table: person, foreign_key: principalinvestigator_person_id }
  orphan_id: { type: int32, dtype: foreignkey }
  wall_time: { type: uint32, unit: seconds, comments: "Wall time" }
  cpu_ratio: { type: double, formula: "cpu_time / wall_time", with_error: true }
"#,
        )
        .unwrap();
        let catalog = raw_statistics_catalog(&config);
        assert_eq!(catalog["+realms"], json!([{"name": "SUPREMM", "display": "SUPReMM"}]));

        let tables = catalog["SUPREMM"]["tables"].as_array().unwrap();
        let aliases: Vec<(&str, &str)> = tables
            .iter()
            .map(|t| (t["name"].as_str().unwrap(), t["alias"].as_str().unwrap()))
            .collect();
        assert_eq!(aliases, vec![("person", "ft1"), ("person", "ft2"), ("resourcefact", "ft3")]);
        assert_eq!(tables[0]["join"]["foreignKey"], "person_id");
        assert_eq!(tables[1]["join"]["foreignKey"], "principalinvestigator_person_id");

        let fields = catalog["SUPREMM"]["fields"].as_array().unwrap();
        let keys: Vec<&str> = fields.iter().map(|f| f["key"].as_str().unwrap()).collect();
        assert_eq!(keys, vec!["resource_id", "person_id", "pi_person_id", "cpu_ratio", "wall_time"]);

        assert_eq!(fields[0]["alias"], "Resource");
        assert_eq!(fields[0]["column"], "code");
        let person = &fields[1];
        assert_eq!(person["alias"], "User");
        assert_eq!(person["column"], "long_name");
        assert_eq!(person["tableAlias"], "ft1");
        assert_eq!(fields[2]["name"], "Pi Person");
        let ratio = &fields[3];
        assert_eq!(ratio["formula"], "cpu_time / wall_time");
        assert!(ratio.get("column").is_none());
        assert_eq!(ratio["withError"], true);
        assert_eq!(ratio["name"], "Cpu Ratio");
        assert_eq!(fields[4]["units"], "seconds");
        assert_eq!(fields[4]["batchExport"], false);
    }

    #[test]
    fn run_writes_realm_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("output_db")).unwrap();
        fs::write(root.join("output_db/groupbys.json"), r#"{"person": {"name": "User"}}"#).unwrap();
        fs::write(root.join("roles.json"), r#"{"roles": {"pub": {"query_descripters": []}}}"#).unwrap();

        let mut tables = BTreeMap::new();
        tables.insert("supremm".to_string(), table());
        let paths = IntegrationPaths::under(root);
        let templates = SourceTemplates {
            group_by: Some(SourceTemplate {
                text: "class GroupBy{{class}} // {{name}}".into(),
                extension: "php".into(),
            }),
            statistic: None,
        };
        let written = Integration {
            aggregation_tables: &tables,
            raw_statistics: None,
            group_by_none_roles: None,
            version: "1.0.0",
            paths: &paths,
            templates: &templates,
        }
        .run()
        .unwrap();

        assert!(written.contains(&root.join("supremmconfig.json")));
        assert!(written.contains(&root.join("roles.d/supremm.json")));
        let group_bys: Value = serde_json::from_str(
            &fs::read_to_string(root.join("datawarehouse.d/ref/supremm-group-bys.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(group_bys["person"]["name"], "User");
        let queue = fs::read_to_string(root.join("sources/supremm/group_bys/Queue.php")).unwrap();
        assert_eq!(queue, "class GroupByQueue // Queue");
    }
}
