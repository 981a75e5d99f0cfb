//! JSON-lines document store.
//!
//! A collection is the file `<uri>/<collection>.jsonl`, one document per
//! line. Processed marks are appended to `<uri>/<collection>.processed.jsonl`
//! and merged back into documents under the configured processed field when
//! the collection is read, so queries can filter on them.
//!
//! Queries support equality on dotted paths and the operators `$eq`, `$ne`,
//! `$exists`, `$gt`, `$gte`, `$lt`, `$lte`, `$in` and `$nin`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use jobetl_core::config::InputConfig;
use jobetl_core::sorting::compare_values;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info};

use crate::source::{document_id, lookup, DocumentStore, DocumentStream, MarkInfo, SourceError};

const OPERATORS: [&str; 9] = ["$eq", "$ne", "$exists", "$gt", "$gte", "$lt", "$lte", "$in", "$nin"];

type Marks = HashMap<String, Map<String, Value>>;

pub struct JsonlStore {
    name: String,
    dir: PathBuf,
    collection: String,
    processed_field: String,
    ledger: Mutex<()>,
    closed: AtomicBool,
}

#[derive(Serialize)]
struct MarkRecord<'a> {
    #[serde(rename = "_id")]
    id: &'a str,
    ts: i64,
    #[serde(flatten)]
    info: &'a MarkInfo,
}

#[derive(Deserialize)]
struct StoredMark {
    #[serde(rename = "_id")]
    id: String,
    profile: String,
    version: String,
}

impl JsonlStore {
    pub fn new(config: &InputConfig) -> Self {
        Self {
            name: format!("{}/{}", config.uri, config.collection),
            dir: PathBuf::from(&config.uri),
            collection: config.collection.clone(),
            processed_field: config.processed_field.clone(),
            ledger: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    fn collection_path(&self) -> PathBuf {
        self.dir.join(format!("{}.jsonl", self.collection))
    }

    fn ledger_path(&self) -> PathBuf {
        self.dir.join(format!("{}.processed.jsonl", self.collection))
    }

    fn check_open(&self) -> Result<(), SourceError> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(SourceError::Closed);
        }
        Ok(())
    }

    async fn check_collection(&self) -> Result<(), SourceError> {
        if fs::metadata(self.collection_path()).await.is_err() {
            return Err(SourceError::MissingCollection {
                uri: self.dir.display().to_string(),
                collection: self.collection.clone(),
            });
        }
        Ok(())
    }

    /// Latest version per profile for every marked document.
    async fn load_marks(&self) -> Result<Marks, SourceError> {
        let _guard = self.ledger.lock().await;
        let text = match fs::read_to_string(self.ledger_path()).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Marks::new()),
            Err(e) => return Err(e.into()),
        };
        let mut marks = Marks::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mark: StoredMark = serde_json::from_str(line)
                .map_err(|source| SourceError::Malformed { line: i + 1, source })?;
            marks
                .entry(mark.id)
                .or_default()
                .insert(mark.profile, Value::String(mark.version));
        }
        Ok(marks)
    }
}

#[async_trait]
impl DocumentStore for JsonlStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(
        &self,
        query: &Map<String, Value>,
        sort: Option<&Map<String, Value>>,
    ) -> Result<DocumentStream, SourceError> {
        self.check_open()?;
        validate_query(query)?;
        let sort = sort.map(sort_keys).transpose()?;
        self.check_collection().await?;
        let marks = Arc::new(self.load_marks().await?);
        let query = query.clone();
        let field = self.processed_field.clone();

        let file = fs::File::open(self.collection_path()).await?;
        let lines = LinesStream::new(BufReader::new(file).lines());
        let docs = lines.enumerate().filter_map(move |(i, line)| {
            let out = match line {
                Err(e) => Some(Err(SourceError::Io(e))),
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => match serde_json::from_str::<Value>(&line) {
                    Err(source) => Some(Err(SourceError::Malformed { line: i + 1, source })),
                    Ok(mut doc) => {
                        merge_marks(&mut doc, &field, &marks);
                        matches(&doc, &query).then_some(Ok(doc))
                    }
                },
            };
            futures::future::ready(out)
        });

        let Some(keys) = sort else {
            info!(store = %self.name, "streaming collection");
            return Ok(docs.boxed());
        };
        let mut all = docs.collect::<Vec<_>>().await.into_iter().collect::<Result<Vec<_>, _>>()?;
        all.sort_by(|a, b| compare_sorted(a, b, &keys));
        info!(store = %self.name, documents = all.len(), "sorted collection");
        Ok(futures::stream::iter(all.into_iter().map(Ok)).boxed())
    }

    async fn ensure_index(&self, fields: &[String]) -> Result<(), SourceError> {
        self.check_open()?;
        self.check_collection().await?;
        debug!(store = %self.name, ?fields, "jsonl collections are scanned, index not needed");
        Ok(())
    }

    async fn mark_as_processed(&self, id: &str, info: &MarkInfo) -> Result<(), SourceError> {
        self.check_open()?;
        let record = MarkRecord {
            id,
            ts: Utc::now().timestamp(),
            info,
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|source| SourceError::Malformed { line: 0, source })?;
        line.push('\n');

        let _guard = self.ledger.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.ledger_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.closed.store(true, AtomicOrdering::SeqCst);
        info!(store = %self.name, "document store closed");
        Ok(())
    }
}

fn merge_marks(doc: &mut Value, field: &str, marks: &Marks) {
    let Some(id) = document_id(doc) else {
        return;
    };
    let Some(versions) = marks.get(&id) else {
        return;
    };
    let Value::Object(map) = doc else {
        return;
    };
    let entry = map
        .entry(field.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(processed) = entry {
        for (profile, version) in versions {
            processed.insert(profile.clone(), version.clone());
        }
    }
}

fn validate_query(query: &Map<String, Value>) -> Result<(), SourceError> {
    for (path, cond) in query {
        let Value::Object(ops) = cond else {
            continue;
        };
        for (op, arg) in ops {
            if !op.starts_with('$') {
                continue;
            }
            if !OPERATORS.contains(&op.as_str()) {
                return Err(SourceError::InvalidQuery(format!("unknown operator {op} on {path}")));
            }
            if matches!(op.as_str(), "$in" | "$nin") && !arg.is_array() {
                return Err(SourceError::InvalidQuery(format!("{op} on {path} needs an array")));
            }
        }
    }
    Ok(())
}

fn is_operator_object(cond: &Value) -> bool {
    matches!(cond, Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')))
}

fn matches(doc: &Value, query: &Map<String, Value>) -> bool {
    query.iter().all(|(path, cond)| {
        let found = lookup(doc, path);
        if !is_operator_object(cond) {
            return found.is_some_and(|v| equal(v, cond));
        }
        let Value::Object(ops) = cond else {
            return false;
        };
        ops.iter().all(|(op, arg)| match op.as_str() {
            "$eq" => found.is_some_and(|v| equal(v, arg)),
            "$ne" => !found.is_some_and(|v| equal(v, arg)),
            "$exists" => found.is_some() == arg.as_bool().unwrap_or(true),
            "$gt" => ordered(found, arg, Ordering::is_gt),
            "$gte" => ordered(found, arg, Ordering::is_ge),
            "$lt" => ordered(found, arg, Ordering::is_lt),
            "$lte" => ordered(found, arg, Ordering::is_le),
            "$in" => found.is_some_and(|v| arg.as_array().is_some_and(|a| a.iter().any(|x| equal(v, x)))),
            "$nin" => !found.is_some_and(|v| arg.as_array().is_some_and(|a| a.iter().any(|x| equal(v, x)))),
            _ => false,
        })
    })
}

fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn ordered(found: Option<&Value>, arg: &Value, test: fn(Ordering) -> bool) -> bool {
    match found {
        Some(v) if std::mem::discriminant(v) == std::mem::discriminant(arg) => {
            test(compare_values(Some(v), Some(arg)))
        }
        _ => false,
    }
}

fn sort_keys(sort: &Map<String, Value>) -> Result<Vec<(String, bool)>, SourceError> {
    sort.iter()
        .map(|(key, dir)| match dir.as_i64() {
            Some(1) => Ok((key.clone(), false)),
            Some(-1) => Ok((key.clone(), true)),
            _ => Err(SourceError::InvalidQuery(format!("sort direction of {key} must be 1 or -1"))),
        })
        .collect()
}

fn compare_sorted(a: &Value, b: &Value, keys: &[(String, bool)]) -> Ordering {
    keys.iter()
        .map(|(key, descending)| {
            let ord = compare_values(lookup(a, key), lookup(b, key));
            if *descending {
                ord.reverse()
            } else {
                ord
            }
        })
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}
