//! Aggregation tables implied by the schema's `agg` hints.

use std::collections::BTreeMap;

use jobetl_core::schema::{AggSpec, RoleAccess, Schema, SchemaField, StatSpec, TableSpec};
use jobetl_core::sql;
use jobetl_core::types::FieldType;
use serde_json::Value;

use crate::dynamic_table::TableError;

/// One column of an aggregation table.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationColumn {
    pub name: String,
    /// Group-by identifier(s); defaults to the column name.
    pub alias: Option<Value>,
    pub field_type: FieldType,
    pub roles: Option<RoleAccess>,
    pub length: u32,
    pub comments: String,
    pub dynamictags: Vec<String>,
    pub nullable: bool,
    pub stats: Vec<StatSpec>,
    pub label: Option<String>,
    pub dimension_table: Option<String>,
    pub category: Option<String>,
    pub def: Value,
    pub dimension: bool,
    pub show_all_dimension_values: bool,
    /// Expression computing the column from the fact table.
    pub sql: String,
    pub sql_type: String,
    /// The source expression, not the column name, is grouped on.
    pub use_sql_in_group_by: bool,
}

#[derive(Debug, Clone)]
pub struct AggregationTable {
    pub name: String,
    pub meta: TableSpec,
    pub columns: BTreeMap<String, AggregationColumn>,
}

impl AggregationTable {
    /// Realm fed by this table.
    pub fn realm(&self) -> Result<&str, TableError> {
        self.meta
            .realm_name
            .as_deref()
            .ok_or_else(|| TableError::MissingRealm(self.name.clone()))
    }

    /// Columns sorted by name.
    pub fn fields(&self) -> Vec<&AggregationColumn> {
        let mut fields: Vec<_> = self.columns.values().collect();
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        fields
    }
}

fn column_type(table: &str, name: &str, ty: &FieldType, length: u32) -> Result<String, TableError> {
    sql::sql_type(ty, Some(length)).map_err(|source| TableError::ColumnType {
        table: table.to_string(),
        column: name.to_string(),
        source,
    })
}

fn aggregation_column(agg: &AggSpec, field: &SchemaField, source_name: &str) -> Result<AggregationColumn, TableError> {
    let name = agg
        .name
        .as_deref()
        .unwrap_or(source_name)
        .replace(":field_name", source_name);
    let sql_expr = agg
        .sql
        .clone()
        .unwrap_or_else(|| name.clone())
        .replace(":field_name", source_name);
    let field_type = agg.field_type.clone().unwrap_or_else(|| field.field_type.clone());
    let length = agg.length.or(field.length).unwrap_or(50);
    let sql_type = column_type(&agg.table, &name, &field_type, length)?;
    let def = match &agg.def {
        Some(def) if !def.is_null() => def.clone(),
        _ => field.def.clone(),
    };
    Ok(AggregationColumn {
        alias: agg.alias.clone(),
        roles: agg.roles.clone().or_else(|| field.roles.clone()),
        length,
        comments: agg
            .comments
            .clone()
            .or_else(|| field.comments.clone())
            .unwrap_or_default(),
        dynamictags: agg
            .dynamictags
            .clone()
            .unwrap_or_else(|| field.dynamictags.clone()),
        nullable: agg.nullable.unwrap_or(false) || field.nullable,
        stats: agg.stats.clone().unwrap_or_else(|| field.stats.clone()),
        label: agg.label.clone(),
        dimension_table: agg.dimension_table.clone(),
        category: agg.category.clone(),
        def,
        dimension: agg.dimension,
        show_all_dimension_values: agg.show_all_dimension_values,
        use_sql_in_group_by: agg.sql.is_some() && agg.name.is_none(),
        name,
        sql: sql_expr,
        sql_type,
        field_type,
    })
}

/// Build every aggregation table fed by the schema's derived fields and the
/// given mapping attributes, then add each table's own extra `fields`
/// (always nullable, without default).
pub fn aggregation_tables<'a>(
    schema: &Schema,
    attributes: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, AggregationTable>, TableError> {
    let mut names: Vec<String> = schema.derived_names().map(str::to_string).collect();
    for name in attributes {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }

    let mut tables: BTreeMap<String, AggregationTable> = BTreeMap::new();
    for source_name in &names {
        let Some(field) = schema.field_or_derived(source_name) else {
            continue;
        };
        for agg in &field.agg {
            let meta = schema.aggregation_table(&agg.table).ok_or_else(|| {
                TableError::UnknownAggregationTable {
                    field: source_name.clone(),
                    table: agg.table.clone(),
                }
            })?;
            let column = aggregation_column(agg, &field, source_name)?;
            tables
                .entry(agg.table.clone())
                .or_insert_with(|| AggregationTable {
                    name: agg.table.clone(),
                    meta: meta.clone(),
                    columns: BTreeMap::new(),
                })
                .columns
                .insert(column.name.clone(), column);
        }
    }

    for table in tables.values_mut() {
        for (name, extra) in &table.meta.fields {
            let length = extra.length.unwrap_or(50);
            let column = AggregationColumn {
                name: name.clone(),
                alias: None,
                field_type: extra.field_type.clone(),
                roles: extra.roles.clone(),
                length,
                comments: extra.comments.clone().unwrap_or_default(),
                dynamictags: extra.dynamictags.clone(),
                nullable: true,
                stats: extra.stats.clone(),
                label: None,
                dimension_table: None,
                category: None,
                def: Value::Null,
                dimension: false,
                show_all_dimension_values: false,
                sql: name.clone(),
                sql_type: column_type(&table.name, name, &extra.field_type, length)?,
                use_sql_in_group_by: false,
            };
            table.columns.insert(name.clone(), column);
        }
    }

    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobetl_core::schema::SchemaSpec;

    fn schema() -> Schema {
        let spec: SchemaSpec = serde_yaml::from_str(
            r#"
tables:
  jobfact: { schema: modw_supremm }
aggregation_tables:
  jobfact_agg:
    schema: modw_aggregates
    realm_name: SUPREMM
    fields:
      job_count: { type: int32, comments: "number of jobs" }
fields:
  cpu_user:
    type: double
    table: jobfact
    comments: "CPU user fraction"
    agg:
      - table: jobfact_agg
        name: ":field_name_weighted"
        sql: "SUM(:field_name * jf.cpu_time)"
        stats:
          - { label: "CPU User", sql: "SUM(:field_name) / SUM(job_count)", decimals: 2 }
  queue:
    type: string
    nullable: false
    length: 32
    table: jobfact
    agg: { table: jobfact_agg, dimension: true, label: "Queue", sql: "jf.queue", category: Administrative }
"#,
        )
        .unwrap();
        Schema::new(spec).unwrap()
    }

    #[test]
    fn builds_columns_from_hints() {
        let tables = aggregation_tables(&schema(), ["cpu_user", "queue"]).unwrap();
        let table = &tables["jobfact_agg"];
        assert_eq!(table.realm().unwrap(), "SUPREMM");

        let names: Vec<_> = table.fields().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cpu_user_weighted", "job_count", "queue"]);

        let cpu = &table.columns["cpu_user_weighted"];
        assert_eq!(cpu.sql, "SUM(cpu_user * jf.cpu_time)");
        assert_eq!(cpu.sql_type, "double");
        assert!(cpu.nullable);
        assert!(!cpu.use_sql_in_group_by);
        assert_eq!(cpu.stats.len(), 1);
        assert_eq!(cpu.comments, "CPU user fraction");

        let queue = &table.columns["queue"];
        assert!(queue.dimension);
        assert!(queue.use_sql_in_group_by);
        assert_eq!(queue.sql_type, "varchar(32)");
        assert!(!queue.nullable);

        let extra = &table.columns["job_count"];
        assert!(extra.nullable);
        assert_eq!(extra.def, Value::Null);
        assert_eq!(extra.sql_type, "int");
    }

    #[test]
    fn unmapped_fields_do_not_contribute() {
        let tables = aggregation_tables(&schema(), ["queue"]).unwrap();
        assert!(!tables["jobfact_agg"].columns.contains_key("cpu_user_weighted"));
    }
}
