//! Generated fact tables and their paired error tables.

use std::collections::BTreeMap;
use std::sync::Arc;

use jobetl_core::schema::{Schema, SchemaField, TableDefinition, TableSpec};
use jobetl_core::sql::{self, SqlTypeError};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("column \"{column}\" of table \"{table}\": {source}")]
    ColumnType {
        table: String,
        column: String,
        #[source]
        source: SqlTypeError,
    },
    #[error("aggregation hint of \"{field}\" refers to unknown aggregation table \"{table}\"")]
    UnknownAggregationTable { field: String, table: String },
    #[error("aggregation table \"{0}\" has no realm_name")]
    MissingRealm(String),
}

/// One generated fact table.
///
/// Columns are keyed (and therefore ordered) by name. The paired error table
/// `<name>_errors` has the same columns; required dimensions keep their
/// values there, every other column stores a metric error code.
#[derive(Debug, Clone)]
pub struct DynamicTable {
    pub name: String,
    pub meta: TableSpec,
    pub columns: BTreeMap<String, Arc<SchemaField>>,
}

/// Columns split the way the DDL lists them.
pub struct ColumnGroups<'a> {
    /// Non-nullable without default.
    pub required: Vec<&'a SchemaField>,
    /// Non-nullable with a default.
    pub defaulted: Vec<&'a SchemaField>,
    /// Nullable.
    pub metrics: Vec<&'a SchemaField>,
}

impl DynamicTable {
    pub fn new(name: impl Into<String>, meta: TableSpec) -> Self {
        Self {
            name: name.into(),
            meta,
            columns: BTreeMap::new(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.meta.schema, self.name)
    }

    pub fn groups(&self) -> ColumnGroups<'_> {
        let mut groups = ColumnGroups {
            required: Vec::new(),
            defaulted: Vec::new(),
            metrics: Vec::new(),
        };
        for column in self.columns.values() {
            if column.nullable {
                groups.metrics.push(column);
            } else if column.def.is_null() {
                groups.required.push(column);
            } else {
                groups.defaulted.push(column);
            }
        }
        groups
    }

    fn column_type(&self, column: &SchemaField) -> Result<String, TableError> {
        column.sql_type().map_err(|source| TableError::ColumnType {
            table: self.name.clone(),
            column: column.name.clone(),
            source,
        })
    }

    /// Fact row insert template with a `:column` placeholder per column.
    ///
    /// With `upsert`, a duplicate unique key updates the existing row and
    /// makes its `_id` the statement's insert id.
    pub fn insert_statement(&self, upsert: bool, ignore: bool, version: &str) -> String {
        let names: Vec<&str> = self.columns.keys().map(String::as_str).collect();
        let mut stmt = format!(
            "INSERT {}INTO {}({},_version) VALUES (:{},{})",
            if ignore { "IGNORE " } else { "" },
            self.qualified_name(),
            names.join(","),
            names.join(",:"),
            version_literal(version)
        );
        if upsert {
            let updates: Vec<String> = names
                .iter()
                .filter(|name| !self.meta.unique.iter().any(|u| u == *name))
                .map(|name| format!("{name}=VALUES({name})"))
                .collect();
            stmt.push_str(" ON DUPLICATE KEY UPDATE _id=LAST_INSERT_ID(_id),_version=VALUES(_version)");
            for update in updates {
                stmt.push(',');
                stmt.push_str(&update);
            }
        }
        stmt
    }

    /// Error row insert template; `:_id` is the fact row's id.
    pub fn error_insert_statement(&self, replace: bool, ignore: bool, version: &str) -> String {
        let names: Vec<&str> = self.columns.keys().map(String::as_str).collect();
        let verb = match (replace, ignore) {
            (true, _) => "replace",
            (false, true) => "insert ignore",
            (false, false) => "insert",
        };
        format!(
            "{verb} into {}_errors (_id,{},_version) values (:_id, :{},{})",
            self.qualified_name(),
            names.join(","),
            names.join(",:"),
            version_literal(version)
        )
    }

    /// `CREATE TABLE` for the fact table followed by one statement per
    /// configured trigger.
    pub fn create_table_statements(&self) -> Result<Vec<String>, TableError> {
        let groups = self.groups();
        let mut lines = vec!["_id INT NOT NULL AUTO_INCREMENT".to_string()];
        for column in &groups.required {
            lines.push(format!(
                "{} {} NOT NULL {}",
                column.name,
                self.column_type(column)?,
                comment_clause(column)
            ));
        }
        for column in &groups.defaulted {
            lines.push(format!(
                "{} {} NOT NULL DEFAULT '{}' {}",
                column.name,
                self.column_type(column)?,
                default_text(&column.def),
                comment_clause(column)
            ));
        }
        for column in &groups.metrics {
            let default = if column.def.is_null() {
                "NULL".to_string()
            } else {
                format!("'{}'", default_text(&column.def))
            };
            lines.push(format!(
                "{} {} DEFAULT {} {}",
                column.name,
                self.column_type(column)?,
                default,
                comment_clause(column)
            ));
        }
        lines.push("_version INT NOT NULL".to_string());
        lines.push(format!("UNIQUE KEY pk_index ({})", self.meta.unique.join(",")));
        lines.extend(self.meta.extras.iter().cloned());
        lines.push("PRIMARY KEY (_id)".to_string());

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {}(\n    {}\n) engine = myisam",
            self.name,
            lines.join(",\n    ")
        )];
        statements.extend(self.trigger_statements());
        Ok(statements)
    }

    fn trigger_statements(&self) -> Vec<String> {
        const VERBS: [(&str, &str); 2] = [("before", "BEFORE"), ("after", "AFTER")];
        const NOUNS: [(&str, &str); 3] = [("insert", "INSERT"), ("update", "UPDATE"), ("del", "DELETE")];
        let schema = &self.meta.schema;
        let mut out = Vec::new();
        for (verb, verb_sql) in VERBS {
            for (noun, noun_sql) in NOUNS {
                let Some(body) = self.meta.triggers.get(&format!("{verb}_{noun}")) else {
                    continue;
                };
                let trigger = format!("`{schema}`.`{}{verb}{noun}`", self.name);
                out.push(format!(
                    "DELIMITER $$\nDROP TRIGGER IF EXISTS {trigger}$$\nUSE `{schema}`$$\nCREATE TRIGGER {trigger}\n{verb_sql} {noun_sql} ON `{}`\nFOR EACH ROW\nBEGIN\n{body}END$$\nDELIMITER ;\n",
                    self.name
                ));
            }
        }
        out
    }

    /// `CREATE TABLE` for `<name>_errors`.
    pub fn create_error_table_statement(&self) -> Result<String, TableError> {
        let groups = self.groups();
        let mut lines = vec!["_id INT NOT NULL".to_string()];
        for column in &groups.required {
            lines.push(format!(
                "{} {} NOT NULL COMMENT 'DIMENSION VALUE'",
                column.name,
                self.column_type(column)?
            ));
        }
        for column in groups.defaulted.iter().chain(&groups.metrics) {
            lines.push(format!("{} int DEFAULT NULL COMMENT 'ERROR CODE'", column.name));
        }
        lines.push("_version INT NOT NULL".to_string());
        lines.extend(self.meta.extras.iter().cloned());
        lines.push("PRIMARY KEY (_id)".to_string());
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {}_errors (\n    {}\n) engine = myisam",
            self.name,
            lines.join(",\n    ")
        ))
    }

    /// One row per column: required dimensions, then defaulted dimensions,
    /// then facts.
    pub fn documentation(&self) -> Vec<DocRow> {
        let groups = self.groups();
        let dims = groups.required.iter().chain(&groups.defaulted).map(|c| (c, "DIMENSION"));
        let facts = groups.metrics.iter().map(|c| (c, "FACT"));
        dims.chain(facts)
            .map(|(column, kind)| DocRow {
                kind,
                name: column.name.clone(),
                comments: column.comments.clone().unwrap_or_else(|| "-".into()),
                unit: column.unit.clone().unwrap_or_else(|| "-".into()),
                per: column.per.clone().unwrap_or_else(|| "-".into()),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRow {
    pub kind: &'static str,
    pub name: String,
    pub comments: String,
    pub unit: String,
    pub per: String,
}

fn comment_clause(column: &SchemaField) -> String {
    format!(
        "COMMENT {}",
        sql::escape_string(column.comments.as_deref().unwrap_or(""))
    )
}

fn default_text(def: &Value) -> String {
    match def {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Integral versions are written as numbers, anything else as a string.
fn version_literal(version: &str) -> String {
    match version.parse::<i64>() {
        Ok(v) => v.to_string(),
        Err(_) => sql::escape_string(version),
    }
}

/// Derive the dynamic tables fed by `attributes` plus the schema's derived
/// fields. Fields without a table, or whose table is static, are skipped.
/// Column comments get their `:label_N` tags substituted.
pub fn dynamic_tables<'a>(
    schema: &Schema,
    attributes: impl IntoIterator<Item = &'a str>,
) -> BTreeMap<String, DynamicTable> {
    let mut tables: BTreeMap<String, DynamicTable> = BTreeMap::new();
    let names = schema
        .derived_names()
        .map(str::to_string)
        .chain(attributes.into_iter().map(str::to_string))
        .collect::<Vec<_>>();
    for name in names {
        let Some(field) = schema.field_or_derived(&name) else {
            continue;
        };
        let Some(table_name) = field.table.as_deref() else {
            continue;
        };
        let Some(meta) = schema
            .table(table_name)
            .filter(|t| t.definition == TableDefinition::Dynamic)
        else {
            continue;
        };
        let mut column = (*field).clone();
        column.name = name.clone();
        column.comments = column.comments.as_deref().map(|c| column.substitute_tags(c));
        tables
            .entry(table_name.to_string())
            .or_insert_with(|| DynamicTable::new(table_name, meta.clone()))
            .columns
            .insert(name, Arc::new(column));
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobetl_core::schema::SchemaSpec;

    fn table() -> DynamicTable {
        let spec: SchemaSpec = serde_yaml::from_str(
            r#"
tables:
  jobfact:
    schema: modw_supremm
    unique: [local_job_id, resource_id]
    triggers: { after_insert: "SET @x = 1;\n" }
  lookup: { schema: modw, definition: static }
fields:
  local_job_id: { type: uint32, nullable: false, table: jobfact, comments: "job id" }
  queue: { type: string, nullable: false, def: "unknown", length: 32, table: jobfact }
  cpu_user: { type: double, table: jobfact, unit: ratio }
  code: { type: string, table: lookup }
derived_fields:
  resource_id: { type: int32, nullable: false, table: jobfact, query: "SELECT 1 AS resource_id" }
"#,
        )
        .unwrap();
        let schema = Schema::new(spec).unwrap();
        let mut tables = dynamic_tables(&schema, ["local_job_id", "queue", "cpu_user", "code"]);
        assert_eq!(tables.len(), 1);
        tables.remove("jobfact").unwrap()
    }

    #[test]
    fn insert_statement_updates_non_unique_columns() {
        let t = table();
        assert_eq!(
            t.insert_statement(true, false, "3"),
            "INSERT INTO modw_supremm.jobfact(cpu_user,local_job_id,queue,resource_id,_version) \
             VALUES (:cpu_user,:local_job_id,:queue,:resource_id,3) \
             ON DUPLICATE KEY UPDATE _id=LAST_INSERT_ID(_id),_version=VALUES(_version),\
             cpu_user=VALUES(cpu_user),queue=VALUES(queue)"
        );
        assert!(t
            .insert_statement(false, true, "1.2.0")
            .starts_with("INSERT IGNORE INTO"));
        assert!(t.insert_statement(false, true, "1.2.0").ends_with(",'1.2.0')"));
    }

    #[test]
    fn error_insert_statement_leads_with_id() {
        assert_eq!(
            table().error_insert_statement(true, false, "3"),
            "replace into modw_supremm.jobfact_errors (_id,cpu_user,local_job_id,queue,resource_id,_version) \
             values (:_id, :cpu_user,:local_job_id,:queue,:resource_id,3)"
        );
    }

    #[test]
    fn ddl_orders_required_then_defaulted_then_metrics() {
        let statements = table().create_table_statements().unwrap();
        assert_eq!(statements.len(), 2);
        let ddl = &statements[0];
        let pos = |needle: &str| ddl.find(needle).unwrap();
        assert!(pos("_id INT NOT NULL AUTO_INCREMENT") < pos("local_job_id int unsigned NOT NULL"));
        assert!(pos("resource_id int NOT NULL") < pos("queue varchar(32) NOT NULL DEFAULT 'unknown'"));
        assert!(pos("queue varchar(32)") < pos("cpu_user double DEFAULT NULL"));
        assert!(ddl.contains("UNIQUE KEY pk_index (local_job_id,resource_id)"));
        assert!(ddl.ends_with("PRIMARY KEY (_id)\n) engine = myisam"));
        assert!(statements[1].contains("CREATE TRIGGER `modw_supremm`.`jobfactafterinsert`"));
        assert!(statements[1].contains("AFTER INSERT ON `jobfact`"));
    }

    #[test]
    fn error_ddl_keeps_required_values_only() {
        let ddl = table().create_error_table_statement().unwrap();
        assert!(ddl.contains("local_job_id int unsigned NOT NULL COMMENT 'DIMENSION VALUE'"));
        assert!(ddl.contains("queue int DEFAULT NULL COMMENT 'ERROR CODE'"));
        assert!(ddl.contains("cpu_user int DEFAULT NULL COMMENT 'ERROR CODE'"));
        assert!(!ddl.contains("AUTO_INCREMENT"));
    }

    #[test]
    fn documentation_rows() {
        let rows = table().documentation();
        let kinds: Vec<_> = rows.iter().map(|r| (r.kind, r.name.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                ("DIMENSION", "local_job_id"),
                ("DIMENSION", "resource_id"),
                ("DIMENSION", "queue"),
                ("FACT", "cpu_user"),
            ]
        );
        assert_eq!(rows[3].unit, "ratio");
        assert_eq!(rows[1].comments, "-");
    }
}
