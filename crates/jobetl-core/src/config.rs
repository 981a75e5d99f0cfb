//! ETL profile configuration.
//!
//! A profile is a single YAML (or JSON) document describing the target
//! schema, the datasets feeding it, where rows are written and where run
//! logs go.
//!
//! ```yaml
//! name: supremm
//! version: "1.0.0"
//! root: /etc/xdmod
//! schema:
//!   tables:
//!     jobfact: { schema: modw_supremm, definition: dynamic, unique: [resource_id, local_job_id] }
//!   fields:
//!     cpu_time: { type: double, nullable: false, table: jobfact }
//! datasets:
//!   - name: frank
//!     input:
//!       db_engine: jsonl
//!       config: { uri: /data/summaries, collection: frank }
//!     mapping:
//!       cpu_time: { ref: stats.cpu }
//! output:
//!   db_engine: mysqldb
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::schema::SchemaSpec;

/// Complete ETL profile loaded from YAML configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSpec {
    pub name: String,

    /// Profile version, recorded in run logs and generated realm metadata.
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,

    /// Root of the generated configuration tree (`etl/`, `datawarehouse.d/`,
    /// `roles.d/`, ...). Relative roots resolve against the working directory.
    #[serde(default)]
    pub root: PathBuf,

    pub schema: SchemaSpec,

    pub datasets: Vec<DatasetSpec>,

    pub output: OutputSpec,

    /// Where per-dataset run-log rows are persisted. No run log is written
    /// when absent.
    #[serde(default)]
    pub etl_log: Option<LogStoreSpec>,

    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Named formulas mappings may reference with `formula: <name>`.
    #[serde(default)]
    pub formulas: BTreeMap<String, FormulaSpec>,
}

impl ProfileSpec {
    /// Load a profile from a YAML or JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading profile {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing profile {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Datasets that are not disabled, in declaration order.
    pub fn enabled_datasets(&self) -> impl Iterator<Item = &DatasetSpec> {
        self.datasets.iter().filter(|d| d.enabled)
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetSpec> {
        self.datasets.iter().find(|d| d.name == name)
    }
}

/// One source feeding the profile's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub input: InputSpec,

    /// Attribute name to mapping rule (`ref`, `value`, `error` or `formula`).
    /// Kept as raw JSON here and validated when the dataset map is built.
    #[serde(default)]
    pub mapping: BTreeMap<String, Value>,

    /// Directory holding `input/` and `expected/` fixture pairs.
    #[serde(default)]
    pub regression_test_dir: Option<PathBuf>,
}

/// Source document store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// Store engine discriminator. Only engines known to the runtime are
    /// accepted; anything else fails the dataset.
    pub db_engine: String,

    pub config: InputConfig,

    /// Filter document in the store's query syntax.
    #[serde(default)]
    pub query: Option<Map<String, Value>>,

    /// Sort specification, field name to 1 (ascending) or -1 (descending).
    #[serde(default)]
    pub sort: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub uri: String,

    pub collection: String,

    /// Source documents have percent-encoded object keys that must be
    /// decoded before mapping.
    #[serde(default)]
    pub url_encoded_keys: bool,

    /// Document field recording which profile versions already processed it.
    #[serde(default = "default_processed_field")]
    pub processed_field: String,
}

/// Destination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub db_engine: String,

    /// Driver-specific connection settings passed to the connector.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Run-log destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStoreSpec {
    pub database: String,

    #[serde(default = "default_log_table")]
    pub table: String,
}

/// Runtime tunables of a dataset processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// In-flight document window at start.
    pub initial_window: usize,
    pub max_window: usize,
    pub min_window: usize,
    /// Maximum pooled connections.
    pub pool_size: usize,
    /// Window adjustment and progress report interval, in documents.
    pub print_every: u64,
    /// Per-connection cache entries above which the cache is cleared.
    pub cache_capacity: usize,
    /// Cache size check interval, in documents.
    pub cache_check_every: u64,
    /// Dimension insert statements per multi-statement query.
    pub statement_batch: usize,
    /// Record processed documents back in the source store.
    pub mark_processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<Shard>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            initial_window: 2,
            max_window: 4,
            min_window: 1,
            pool_size: 4,
            print_every: 1000,
            cache_capacity: 1_000_000,
            cache_check_every: 100_000,
            statement_batch: 500,
            mark_processed: true,
            shard: None,
        }
    }
}

/// Partition of a dataset among several workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub total: u64,
    pub index: u64,
}

impl Shard {
    pub fn new(total: u64, index: u64) -> Result<Self> {
        anyhow::ensure!(total > 0, "shard total must be positive");
        anyhow::ensure!(
            index < total,
            "shard index {index} out of range for {total} shards"
        );
        Ok(Self { total, index })
    }

    /// Whether a document with the given shard key belongs to this worker.
    pub fn accepts(&self, key: u64) -> bool {
        self.total <= 1 || key % self.total == self.index
    }
}

/// A formula computed from numeric document values.
///
/// ```yaml
/// formulas:
///   wall_time: { op: difference, minuend: acct.end_time, subtrahend: acct.start_time }
///   cpu_user: { op: ratio, numerator: cpu.user, denominator: cpu.all }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FormulaSpec {
    /// Sum of every path.
    Sum { refs: Vec<String> },
    Difference { minuend: String, subtrahend: String },
    Ratio { numerator: String, denominator: String },
    /// One path multiplied by a constant.
    Scale {
        #[serde(rename = "ref")]
        path: String,
        factor: f64,
    },
    /// Number of elements of an array.
    Count {
        #[serde(rename = "ref")]
        path: String,
    },
}

fn default_true() -> bool {
    true
}

fn default_processed_field() -> String {
    "processed".to_string()
}

fn default_log_table() -> String {
    "log".to_string()
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, found {other}"
        ))),
    }
}

/// Accept either a single item or a list of items.
pub(crate) fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(item)) => vec![item],
        Some(OneOrMany::Many(items)) => items,
    })
}
