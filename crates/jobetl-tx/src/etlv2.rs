//! Declarative table and action definitions for the warehouse ETL engine.
//!
//! Everything here is a pure function of the table description; the only
//! I/O is [`generate_aggregates`] and [`generate_table_definitions`], which
//! write the generated documents as 4-space indented JSON.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::aggregation::AggregationTable;
use crate::dynamic_table::{DynamicTable, TableError};

/// Query placeholders of the live pipeline and their ETL engine spelling.
/// Longer names come first so that `:period` does not eat `:period_id`.
const SQL_REMAP: [(&str, &str); 6] = [
    (":period_start_ts", "${:PERIOD_START_TS}"),
    (":period_end_ts", "${:PERIOD_END_TS}"),
    (":period_id", "${:PERIOD_ID}"),
    (":year", "${:YEAR_VALUE}"),
    (":period", "${:PERIOD_VALUE}"),
    (":seconds", "${:PERIOD_SECONDS}"),
];

const DAY_ID: &str =
    "YEAR(FROM_UNIXTIME({ts})) * 100000 + DAYOFYEAR(FROM_UNIXTIME({ts}))";

/// Rewrite time period placeholders into the ETL engine's variable syntax.
pub fn remap_sql(sql: &str) -> String {
    SQL_REMAP
        .iter()
        .fold(sql.to_string(), |out, (from, to)| out.replace(from, to))
}

fn day_id(ts: &str) -> String {
    DAY_ID.replace("{ts}", ts)
}

/// `<name>_by_day` for the day table (carries the job list), `<name>_by`
/// for the month, quarter and year roll-ups.
pub fn aggregate_table_id(table: &AggregationTable, has_job_list: bool) -> String {
    if has_job_list {
        format!("{}_by_day", table.name)
    } else {
        format!("{}_by", table.name)
    }
}

pub fn job_list_table_id(table: &AggregationTable) -> String {
    format!("{}_joblist", aggregate_table_id(table, true))
}

fn column(name: &str, ty: &str, nullable: bool) -> Map<String, Value> {
    let mut col = Map::new();
    col.insert("name".into(), name.into());
    col.insert("type".into(), ty.into());
    col.insert("nullable".into(), nullable.into());
    col
}

fn with(mut col: Map<String, Value>, key: &str, value: impl Into<Value>) -> Map<String, Value> {
    col.insert(key.into(), value.into());
    col
}

fn index(name: &str, columns: &[&str]) -> Value {
    json!({ "name": name, "columns": columns })
}

fn unique_index(name: &str, columns: &[&str]) -> Value {
    json!({ "name": name, "columns": columns, "type": "BTREE", "is_unique": true })
}

fn default_value(def: &Value) -> Option<Value> {
    match def {
        Value::Null => None,
        Value::String(_) => Some(def.clone()),
        other => Some(Value::String(other.to_string())),
    }
}

/// Definition of the fact table itself.
pub fn fact_table_definition(table: &DynamicTable) -> Result<Value, TableError> {
    let groups = table.groups();
    let mut columns = vec![with(column("_id", "int(11)", false), "extra", "auto_increment")];
    for field in groups.required.iter().chain(&groups.defaulted).chain(&groups.metrics) {
        let ty = field.sql_type().map_err(|source| TableError::ColumnType {
            table: table.name.clone(),
            column: field.name.clone(),
            source,
        })?;
        let mut col = column(&field.name, &ty, field.nullable);
        if let Some(def) = default_value(&field.def) {
            col.insert("default".into(), def);
        }
        if let Some(comment) = &field.comments {
            col.insert("comment".into(), comment.clone().into());
        }
        columns.push(col);
    }
    columns.push(column("_version", "int(11)", false));
    columns.push(with(
        with(column("last_modified", "timestamp", false), "default", "CURRENT_TIMESTAMP"),
        "extra",
        "ON UPDATE CURRENT_TIMESTAMP",
    ));

    let unique: Vec<&str> = table.meta.unique.iter().map(String::as_str).collect();
    let mut indexes = vec![unique_index("PRIMARY", &["_id"])];
    if !unique.is_empty() {
        indexes.push(unique_index("pk_index", &unique));
    }
    indexes.push(index("last_modified", &["last_modified"]));

    Ok(json!({
        "table_definition": {
            "name": table.name,
            "engine": "MyISAM",
            "comment": format!("{} fact table", table.name),
            "columns": columns,
            "indexes": indexes,
            "triggers": [],
        }
    }))
}

/// Definition of `<name>_errors`: `_id` of the fact row, required
/// dimensions with their own type, every other column a nullable error code.
pub fn error_table_definition(table: &DynamicTable) -> Result<Value, TableError> {
    let groups = table.groups();
    let mut columns = vec![column("_id", "int(11)", false)];
    for field in &groups.required {
        let ty = field.sql_type().map_err(|source| TableError::ColumnType {
            table: table.name.clone(),
            column: field.name.clone(),
            source,
        })?;
        columns.push(with(column(&field.name, &ty, false), "comment", "DIMENSION VALUE"));
    }
    for field in groups.defaulted.iter().chain(&groups.metrics) {
        columns.push(with(column(&field.name, "int(11)", true), "comment", "ERROR CODE"));
    }
    Ok(json!({
        "table_definition": {
            "name": format!("{}_errors", table.name),
            "engine": "MyISAM",
            "comment": format!("Metric error codes for {}", table.name),
            "columns": columns,
            "indexes": [unique_index("PRIMARY", &["_id"])],
            "triggers": [],
        }
    }))
}

/// Aggregation table definition for the day (`has_job_list`) or roll-up
/// variant.
pub fn aggregate_table_definition(table: &AggregationTable, has_job_list: bool) -> Value {
    let mut columns = Vec::new();
    if has_job_list {
        columns.push(with(column("id", "int(11)", false), "extra", "auto_increment"));
    }
    columns.push(with(
        column("${AGGREGATION_UNIT}_id", "int(10) unsigned", false),
        "comment",
        "DIMENSION: The id related to modw.${AGGREGATION_UNIT}s.",
    ));
    columns.push(with(
        column("year", "smallint(5) unsigned", false),
        "comment",
        "DIMENSION: The year of the ${AGGREGATION_UNIT}",
    ));
    columns.push(with(
        column("${AGGREGATION_UNIT}", "smallint(5) unsigned", false),
        "comment",
        "DIMENSION: The ${AGGREGATION_UNIT} of the year.",
    ));

    let mut indexes = Vec::new();
    if has_job_list {
        indexes.push(unique_index("PRIMARY", &["id"]));
    }
    indexes.push(index(
        &format!("index_{}_by_${{AGGREGATION_UNIT}}_${{AGGREGATION_UNIT}}_id", table.name),
        &["${AGGREGATION_UNIT}_id"],
    ));
    indexes.push(index(
        &format!("index_{}_by_${{AGGREGATION_UNIT}}_${{AGGREGATION_UNIT}}", table.name),
        &["${AGGREGATION_UNIT}"],
    ));
    if has_job_list {
        indexes.push(index("last_modified", &["last_modified"]));
    }

    for field in table.fields() {
        let kind = if field.dimension { "DIMENSION: " } else { "FACT: " };
        columns.push(with(
            column(&field.name, &field.sql_type, !field.dimension),
            "comment",
            format!("{kind}{}", field.comments),
        ));
        if field.dimension {
            indexes.push(index(&format!("index_{}_{}", table.name, field.name), &[field.name.as_str()]));
        }
    }

    if has_job_list {
        columns.push(with(
            column("job_id_list", "mediumtext", false),
            "comment",
            "METADATA: the ids in the fact table for the rows that went into this row",
        ));
        columns.push(with(
            with(column("last_modified", "timestamp", false), "default", "CURRENT_TIMESTAMP"),
            "extra",
            "ON UPDATE CURRENT_TIMESTAMP",
        ));
    }

    json!({
        "table_definition": {
            "name": aggregate_table_id(table, has_job_list),
            "table_prefix": format!("{}_by_", table.name),
            "engine": "MyISAM",
            "comment": format!("{} aggregated by ${{AGGREGATION_UNIT}}.", table.name),
            "columns": columns,
            "indexes": indexes,
        }
    })
}

fn definition_ref(realm: &str, id: &str) -> String {
    format!(
        "${{table_definition_dir}}/{}/{id}.json#/table_definition",
        realm.to_lowercase()
    )
}

/// Aggregation action: how one period's rows are computed from the fact
/// table.
pub fn aggregate_table_action(table: &AggregationTable, has_job_list: bool) -> Result<Value, TableError> {
    let realm = table.realm()?;
    let mut records = Map::new();
    records.insert("${AGGREGATION_UNIT}_id".into(), "${:PERIOD_ID}".into());
    records.insert("year".into(), "${:YEAR_VALUE}".into());
    records.insert("${AGGREGATION_UNIT}".into(), "${:PERIOD_VALUE}".into());
    let mut groupby = Vec::new();
    for field in table.fields() {
        if field.dimension {
            groupby.push(field.name.clone());
        }
        records.insert(field.name.clone(), remap_sql(&field.sql).into());
    }
    if has_job_list {
        records.insert("job_id_list".into(), "GROUP_CONCAT(jf._id)".into());
    }

    Ok(json!({
        "table_definition": {
            "$ref": definition_ref(realm, &aggregate_table_id(table, has_job_list)),
        },
        "aggregation_period_query": {
            "overseer_restrictions": {
                "last_modified_start_date": "last_modified >= ${VALUE}",
                "last_modified_end_date": "last_modified <= ${VALUE}",
                "include_only_resource_codes": "resource_id IN ${VALUE}",
                "exclude_resource_codes": "resource_id NOT IN ${VALUE}",
            },
            "conversions": {
                "start_day_id": day_id("start_time_ts"),
                "end_day_id": day_id("end_time_ts"),
            },
        },
        "destination_query": {
            "overseer_restrictions": {
                "include_only_resource_codes": "record_resource_id IN ${VALUE}",
                "exclude_resource_codes": "record_resource_id NOT IN ${VALUE}",
            },
        },
        "source_query": {
            "overseer_restrictions": {
                "include_only_resource_codes": "record.resource_id IN ${VALUE}",
                "exclude_resource_codes": "record.resource_id NOT IN ${VALUE}",
            },
            "query_hint": "SQL_NO_CACHE",
            "records": records,
            "groupby": groupby,
            "joins": [{ "name": "job", "schema": "${SOURCE_SCHEMA}", "alias": "jf" }],
            "where": [format!(
                "{} <= ${{:PERIOD_END_DAY_ID}} AND {} >= ${{:PERIOD_START_DAY_ID}}",
                day_id("jf.start_time_ts"),
                day_id("jf.end_time_ts"),
            )],
        },
    }))
}

/// Join table mapping day aggregate rows back to fact rows.
pub fn job_list_table_definition(table: &AggregationTable) -> Value {
    json!({
        "table_definition": {
            "name": job_list_table_id(table),
            "engine": "InnoDB",
            "columns": [column("agg_id", "int(11)", false), column("jobid", "int(11)", false)],
            "indexes": [unique_index("PRIMARY", &["agg_id", "jobid"])],
            "triggers": [],
        }
    })
}

/// Action expanding each day row's `job_id_list` into join table rows.
pub fn job_list_table_action(table: &AggregationTable) -> Result<Value, TableError> {
    let realm = table.realm()?;
    let joblist = job_list_table_id(table);
    let mut destination = Map::new();
    destination.insert(joblist.clone(), json!({ "agg_id": "agg_id", "jobid": "job_id" }));
    Ok(json!({
        "table_definition": { "$ref": definition_ref(realm, &joblist) },
        "source_query": {
            "overseer_restrictions": {
                "last_modified_start_date": "last_modified >= ${VALUE}",
                "last_modified_end_date": "last_modified <= ${VALUE}",
            },
            "records": { "agg_id": "id", "job_id_list": "job_id_list", "job_id": -1 },
            "joins": [{
                "name": aggregate_table_id(table, true),
                "schema": "${SOURCE_SCHEMA}",
                "alias": "jf",
            }],
        },
        "destination_record_map": destination,
    }))
}

/// Serialize `value` with 4-space indentation.
pub fn to_pretty_json(value: &Value) -> Result<String> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut ser)?;
    Ok(String::from_utf8(buf)?)
}

/// Write `<dir>/<stem>.json`, creating `dir` as needed.
pub(crate) fn write_json(dir: &Path, stem: &str, value: &Value) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{stem}.json"));
    fs::write(&path, to_pretty_json(value)?).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "wrote");
    Ok(path)
}

/// Write day, roll-up and job list definitions for every aggregation table
/// under `<root>/etl/etl_action_defs.d/<realm>` and
/// `<root>/etl/etl_tables.d/<realm>`. Returns the written paths.
pub fn generate_aggregates(tables: &BTreeMap<String, AggregationTable>, root: &Path) -> Result<Vec<PathBuf>> {
    let etl_dir = root.join("etl");
    let mut written = Vec::new();
    for table in tables.values() {
        let realm = table.realm()?.to_lowercase();
        let action_dir = etl_dir.join("etl_action_defs.d").join(&realm);
        let table_dir = etl_dir.join("etl_tables.d").join(&realm);

        for has_job_list in [true, false] {
            let id = aggregate_table_id(table, has_job_list);
            written.push(write_json(&action_dir, &id, &aggregate_table_action(table, has_job_list)?)?);
            written.push(write_json(&table_dir, &id, &aggregate_table_definition(table, has_job_list))?);
        }

        let joblist = job_list_table_id(table);
        written.push(write_json(&action_dir, &joblist, &job_list_table_action(table)?)?);
        written.push(write_json(&table_dir, &joblist, &job_list_table_definition(table))?);
    }
    Ok(written)
}

/// Write fact and error table definitions under
/// `<root>/etl/etl_tables.d/<schema>`.
pub fn generate_table_definitions(tables: &BTreeMap<String, DynamicTable>, root: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for table in tables.values() {
        let dir = root.join("etl").join("etl_tables.d").join(&table.meta.schema);
        written.push(write_json(&dir, &table.name, &fact_table_definition(table)?)?);
        written.push(write_json(
            &dir,
            &format!("{}_errors", table.name),
            &error_table_definition(table)?,
        )?);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::aggregation_tables;
    use crate::dynamic_table::dynamic_tables;
    use jobetl_core::schema::{Schema, SchemaSpec};
    use std::collections::BTreeSet;

    fn schema() -> Schema {
        let spec: SchemaSpec = serde_yaml::from_str(
            r#"
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
    agg: { table: supremm, name: record_resource_id, dimension: true, sql: "jf.resource_id", comments: "resource" }
  local_job_id: { type: uint32, nullable: false, table: job }
  queue: { type: string, nullable: false, def: "NA", length: 32, table: job }
  wall_time:
    type: uint32
    table: job
    comments: "wall time"
    agg: { table: supremm, name: wall_time, sql: "SUM(jf.wall_time * :seconds / (jf.end_time_ts - jf.start_time_ts))" }
  cpu_user: { type: double, table: job }
"#,
        )
        .unwrap();
        Schema::new(spec).unwrap()
    }

    const ATTRS: [&str; 5] = ["resource_id", "local_job_id", "queue", "wall_time", "cpu_user"];

    #[test]
    fn remaps_period_placeholders() {
        assert_eq!(
            remap_sql("SUM(:period_end_ts - :period_start_ts) / :seconds WHERE p = :period_id AND y = :year AND q = :period"),
            "SUM(${:PERIOD_END_TS} - ${:PERIOD_START_TS}) / ${:PERIOD_SECONDS} WHERE p = ${:PERIOD_ID} AND y = ${:YEAR_VALUE} AND q = ${:PERIOD_VALUE}"
        );
    }

    #[test]
    fn aggregate_day_table_carries_job_list() {
        let tables = aggregation_tables(&schema(), ATTRS).unwrap();
        let table = &tables["supremm"];
        let def = aggregate_table_definition(table, true);
        let td = &def["table_definition"];
        assert_eq!(td["name"], "supremm_by_day");
        assert_eq!(td["table_prefix"], "supremm_by_");
        let names: Vec<&str> = td["columns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "id",
                "${AGGREGATION_UNIT}_id",
                "year",
                "${AGGREGATION_UNIT}",
                "record_resource_id",
                "wall_time",
                "job_id_list",
                "last_modified"
            ]
        );
        assert_eq!(td["columns"][4]["comment"], "DIMENSION: resource");
        assert_eq!(td["columns"][4]["nullable"], false);
        assert_eq!(td["indexes"].as_array().unwrap().len(), 5);

        let rollup = aggregate_table_definition(table, false);
        assert_eq!(rollup["table_definition"]["name"], "supremm_by");
        assert_eq!(rollup["table_definition"]["columns"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn aggregate_action_remaps_column_sql() {
        let tables = aggregation_tables(&schema(), ATTRS).unwrap();
        let action = aggregate_table_action(&tables["supremm"], true).unwrap();
        assert_eq!(
            action["table_definition"]["$ref"],
            "${table_definition_dir}/supremm/supremm_by_day.json#/table_definition"
        );
        let records = &action["source_query"]["records"];
        assert_eq!(
            records["wall_time"],
            "SUM(jf.wall_time * ${:PERIOD_SECONDS} / (jf.end_time_ts - jf.start_time_ts))"
        );
        assert_eq!(records["job_id_list"], "GROUP_CONCAT(jf._id)");
        assert_eq!(action["source_query"]["groupby"], json!(["record_resource_id"]));

        let rollup = aggregate_table_action(&tables["supremm"], false).unwrap();
        assert!(rollup["source_query"]["records"].get("job_id_list").is_none());
    }

    #[test]
    fn job_list_action_maps_back_to_fact_rows() {
        let tables = aggregation_tables(&schema(), ATTRS).unwrap();
        let action = job_list_table_action(&tables["supremm"]).unwrap();
        assert_eq!(
            action["destination_record_map"]["supremm_by_day_joblist"],
            json!({"agg_id": "agg_id", "jobid": "job_id"})
        );
        assert_eq!(action["source_query"]["joins"][0]["name"], "supremm_by_day");
        let def = job_list_table_definition(&tables["supremm"]);
        assert_eq!(def["table_definition"]["engine"], "InnoDB");
    }

    #[test]
    fn error_table_mirrors_fact_columns() {
        let tables = dynamic_tables(&schema(), ATTRS);
        let job = &tables["job"];
        let fact = fact_table_definition(job).unwrap();
        let errors = error_table_definition(job).unwrap();

        let columns = |def: &Value| -> BTreeMap<String, Value> {
            def["table_definition"]["columns"]
                .as_array()
                .unwrap()
                .iter()
                .map(|c| (c["name"].as_str().unwrap().to_string(), c.clone()))
                .collect()
        };
        let fact_cols = columns(&fact);
        let error_cols = columns(&errors);

        let expected: BTreeSet<&String> = fact_cols
            .keys()
            .filter(|k| *k != "_version" && *k != "last_modified")
            .collect();
        assert_eq!(error_cols.keys().collect::<BTreeSet<_>>(), expected);

        for (name, col) in &error_cols {
            if name == "_id" {
                continue;
            }
            let field = &job.columns[name];
            if field.is_required_dimension() {
                assert_eq!(col["type"], fact_cols[name]["type"]);
                assert_eq!(col["nullable"], false);
            } else {
                assert_eq!(col["type"], "int(11)");
                assert_eq!(col["nullable"], true);
            }
        }
        assert_eq!(errors["table_definition"]["name"], "job_errors");
    }

    #[test]
    fn generation_is_idempotent() {
        let schema = schema();
        let tables = aggregation_tables(&schema, ATTRS).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let first = generate_aggregates(&tables, dir.path()).unwrap();
        let snapshot: Vec<String> = first.iter().map(|p| fs::read_to_string(p).unwrap()).collect();

        let again = aggregation_tables(&schema, ATTRS).unwrap();
        let second = generate_aggregates(&again, dir.path()).unwrap();
        assert_eq!(first, second);
        let reread: Vec<String> = second.iter().map(|p| fs::read_to_string(p).unwrap()).collect();
        assert_eq!(snapshot, reread);

        assert_eq!(first.len(), 6);
        assert!(dir
            .path()
            .join("etl/etl_tables.d/supremm/supremm_by_day_joblist.json")
            .exists());
        assert!(snapshot[0].starts_with("{\n    \""));
    }

    #[test]
    fn table_definitions_are_written_per_schema() {
        let tables = dynamic_tables(&schema(), ATTRS);
        let dir = tempfile::tempdir().unwrap();
        let written = generate_table_definitions(&tables, dir.path()).unwrap();
        assert_eq!(
            written,
            vec![
                dir.path().join("etl/etl_tables.d/modw_supremm/job.json"),
                dir.path().join("etl/etl_tables.d/modw_supremm/job_errors.json"),
            ]
        );
    }
}
