//! Source document stores.
//!
//! A dataset reads its documents through a [`DocumentStore`] chosen by the
//! input's `db_engine`. Only engines listed in [`open_store`] are accepted.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use jobetl_core::config::InputSpec;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::source_jsonl::JsonlStore;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{0} is an unsupported dbEngine")]
    UnsupportedEngine(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("collection \"{collection}\" not found in {uri}")]
    MissingCollection { uri: String, collection: String },
    #[error("malformed document on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("document store is closed")]
    Closed,
}

pub type DocumentStream = BoxStream<'static, Result<Value, SourceError>>;

/// Outcome recorded with a processed document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarkInfo {
    pub profile: String,
    pub version: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub warnings: BTreeMap<String, Vec<String>>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &str;

    /// Stream the documents matching `query`, ordered by `sort` when given
    /// (field to `1` or `-1`).
    async fn find(
        &self,
        query: &Map<String, Value>,
        sort: Option<&Map<String, Value>>,
    ) -> Result<DocumentStream, SourceError>;

    async fn ensure_index(&self, fields: &[String]) -> Result<(), SourceError>;

    /// Record that `id` was processed. Marking the same document again
    /// leaves it in the same state.
    async fn mark_as_processed(&self, id: &str, info: &MarkInfo) -> Result<(), SourceError>;

    async fn close(&self) -> Result<(), SourceError>;
}

/// Open the store an input is configured for.
pub fn open_store(input: &InputSpec) -> Result<Arc<dyn DocumentStore>, SourceError> {
    match input.db_engine.as_str() {
        "jsonl" => Ok(Arc::new(JsonlStore::new(&input.config))),
        other => Err(SourceError::UnsupportedEngine(other.to_string())),
    }
}

/// The input's configured query or, without one, every document not yet
/// processed by this profile version.
pub fn pending_query(input: &InputSpec, profile: &str, version: &str) -> Map<String, Value> {
    if let Some(query) = &input.query {
        return query.clone();
    }
    let mut ne = Map::new();
    ne.insert("$ne".into(), Value::String(version.to_string()));
    let mut query = Map::new();
    query.insert(
        format!("{}.{profile}", input.config.processed_field),
        Value::Object(ne),
    );
    query
}

/// Follow a dotted path into `doc`.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, key| match cur {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// The document's `_id` as text. Object ids of the `{"$oid": ...}` form are
/// unwrapped.
pub fn document_id(doc: &Value) -> Option<String> {
    match doc.get("_id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("$oid").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Partition key of a document id: its first run of decimal digits, or the
/// leading eight bytes of its SHA-256 digest when it has none.
pub fn shard_key(id: &str) -> u64 {
    let digits: String = id
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    if let Ok(key) = digits.parse::<u64>() {
        return key;
    }
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Percent-decode every object key in `value`, recursively.
pub fn decode_url_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (percent_decode(&k), decode_url_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(decode_url_keys).collect()),
        other => other,
    }
}

/// Keys whose escapes do not decode to UTF-8 are kept as they are.
fn percent_decode(key: &str) -> String {
    match percent_decode_str(key).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            warn!(key, error = %e, "key is not valid percent-encoded UTF-8, left undecoded");
            key.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shard_key_uses_first_digit_run() {
        assert_eq!(shard_key("2017-01-15.job.4455"), 2017);
        assert_eq!(shard_key("job-42-x7"), 42);
        let hashed = shard_key("no-digits-here");
        assert_eq!(hashed, shard_key("no-digits-here"));
        assert_ne!(hashed, shard_key("other"));
    }

    #[test]
    fn decodes_nested_keys() {
        let doc = json!({"cpu%2Euser": {"a%24b": 1, "list": [{"x%25": 2}]}, "bad%zz": 3, "end%": 4});
        assert_eq!(
            decode_url_keys(doc),
            json!({"cpu.user": {"a$b": 1, "list": [{"x%": 2}]}, "bad%zz": 3, "end%": 4})
        );
    }

    #[test]
    fn keeps_keys_that_do_not_decode_to_utf8() {
        let doc = json!({"a%C3%28": 1, "caf%C3%A9": 2});
        assert_eq!(decode_url_keys(doc), json!({"a%C3%28": 1, "café": 2}));
    }

    #[test]
    fn ids_and_paths() {
        assert_eq!(document_id(&json!({"_id": {"$oid": "abc"}})).as_deref(), Some("abc"));
        assert_eq!(document_id(&json!({"_id": 12})).as_deref(), Some("12"));
        assert_eq!(document_id(&json!({})), None);
        let doc = json!({"a": {"b": [10, {"c": 3}]}});
        assert_eq!(lookup(&doc, "a.b.1.c"), Some(&json!(3)));
        assert_eq!(lookup(&doc, "a.x"), None);
    }

    #[test]
    fn default_query_skips_current_version() {
        let input: InputSpec = serde_json::from_value(json!({
            "db_engine": "jsonl",
            "config": {"uri": "/tmp", "collection": "c"},
        }))
        .unwrap();
        let query = pending_query(&input, "supremm", "1.0");
        assert_eq!(Value::Object(query), json!({"processed.supremm": {"$ne": "1.0"}}));
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let input: InputSpec = serde_json::from_value(json!({
            "db_engine": "mongodb",
            "config": {"uri": "mongodb://localhost", "collection": "c"},
        }))
        .unwrap();
        assert!(matches!(open_store(&input), Err(SourceError::UnsupportedEngine(e)) if e == "mongodb"));
    }
}
