//! Per-dataset run log rows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::sql;
use crate::stats::ProcessingDetails;
use crate::types::parse_float;

/// Columns of the run log table. Any other key in a payload is rejected.
pub const LOG_KEYS: [&str; 10] = [
    "etlProfileName",
    "etlProfileVersion",
    "dataset",
    "start_ts",
    "end_ts",
    "min_index",
    "max_index",
    "processed",
    "good",
    "details",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LogError {
    #[error("unknown run log key \"{0}\"")]
    UnknownKey(String),
    #[error("processing details could not be serialized: {0}")]
    Details(String),
}

/// A validated run log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RunLogEntry {
    values: Map<String, Value>,
}

impl RunLogEntry {
    /// Validate an arbitrary payload against [`LOG_KEYS`].
    pub fn from_payload(values: Map<String, Value>) -> Result<Self, LogError> {
        if let Some(key) = values.keys().find(|k| !LOG_KEYS.contains(&k.as_str())) {
            return Err(LogError::UnknownKey(key.clone()));
        }
        Ok(Self { values })
    }

    /// Build the row for a finished dataset. `extra` holds additional
    /// configured values and is subject to the same key validation.
    pub fn from_details(
        details: &ProcessingDetails,
        end: DateTime<Utc>,
        extra: &Map<String, Value>,
    ) -> Result<Self, LogError> {
        let base = &details.stats.base;
        let mut values = Map::new();
        values.insert("etlProfileName".into(), details.etl_profile_name.clone().into());
        values.insert(
            "etlProfileVersion".into(),
            details.etl_profile_version.clone().into(),
        );
        values.insert("dataset".into(), details.dataset.clone().into());
        values.insert("start_ts".into(), details.start().timestamp().into());
        values.insert("end_ts".into(), end.timestamp().into());
        values.insert("min_index".into(), index_value(base.min_index));
        values.insert("max_index".into(), index_value(base.max_index));
        values.insert("processed".into(), base.processed.into());
        values.insert("good".into(), base.good.into());
        let details_json =
            serde_json::to_string(details).map_err(|e| LogError::Details(e.to_string()))?;
        values.insert("details".into(), details_json.into());
        for (key, value) in extra {
            values.insert(key.clone(), value.clone());
        }
        Self::from_payload(values)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// `insert into <database>.<table> (...) values (...)` with the row bound.
    pub fn insert_statement(&self, database: &str, table: &str) -> String {
        let keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        let template = format!(
            "insert into {database}.{table} ({}) values (:{})",
            keys.join(","),
            keys.join(",:")
        );
        sql::query_format_map(&template, &self.values)
    }
}

fn index_value(v: Option<f64>) -> Value {
    match v {
        Some(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Value::from(v as i64),
        Some(v) => Value::from(v),
        None => Value::Null,
    }
}

/// Tracks the min/max of the configured index field over inserted rows.
#[derive(Debug, Clone, Default)]
pub struct IndexTracker {
    field: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl IndexTracker {
    pub fn new(field: Option<String>) -> Self {
        Self {
            field,
            min: None,
            max: None,
        }
    }

    pub fn observe(&mut self, row: &Map<String, Value>) {
        let Some(field) = &self.field else {
            return;
        };
        let Some(v) = row.get(field).and_then(parse_float) else {
            return;
        };
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }
}
