//! Test doubles: a scripted SQL connector and an in-memory document store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use jobetl_core::cache::Row;
use jobetl_io::pool::{Connection, Connector, PoolError, QueryResult};
use jobetl_io::source::{DocumentStore, DocumentStream, MarkInfo, SourceError};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

/// Everything the scripted connector saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Query(String),
    Close(u64),
}

/// Failure a [`Scripted`] connector injects.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Every connect attempt fails.
    Connect,
    /// Queries containing the needle fail.
    Query(String),
    /// Inserts containing the needle report no generated id.
    NoInsertId(String),
    /// Connecting panics the calling task.
    Panic,
}

/// Connector whose queries wait on a gate, answer lookups from canned rows
/// and hand out increasing insert ids.
pub struct Scripted {
    pub seen: Arc<Mutex<Vec<Seen>>>,
    pub gate: Arc<Semaphore>,
    lookups: Vec<(String, Vec<Row>)>,
    fault: Option<Fault>,
    sessions: AtomicU64,
    inserts: Arc<AtomicU64>,
}

impl Scripted {
    /// Queries run immediately.
    pub fn open() -> Arc<Self> {
        Self::build(Semaphore::MAX_PERMITS, Vec::new())
    }

    /// Queries block until [`Scripted::release`].
    pub fn gated() -> Arc<Self> {
        Self::build(0, Vec::new())
    }

    /// A lookup whose text contains `needle` returns `rows`.
    pub fn with_lookups(lookups: Vec<(&str, Vec<Value>)>) -> Arc<Self> {
        let lookups = lookups
            .into_iter()
            .map(|(needle, rows)| {
                let rows = rows
                    .into_iter()
                    .filter_map(|r| r.as_object().cloned())
                    .collect();
                (needle.to_string(), rows)
            })
            .collect();
        Self::build(Semaphore::MAX_PERMITS, lookups)
    }

    /// Queries run immediately, except where `fault` applies.
    pub fn faulty(fault: Fault) -> Arc<Self> {
        Self::with_fault(Semaphore::MAX_PERMITS, Vec::new(), Some(fault))
    }

    fn build(permits: usize, lookups: Vec<(String, Vec<Row>)>) -> Arc<Self> {
        Self::with_fault(permits, lookups, None)
    }

    fn with_fault(permits: usize, lookups: Vec<(String, Vec<Row>)>, fault: Option<Fault>) -> Arc<Self> {
        Arc::new(Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            gate: Arc::new(Semaphore::new(permits)),
            lookups,
            fault,
            sessions: AtomicU64::new(0),
            inserts: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1_000);
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Query(q) => Some(q),
                Seen::Close(_) => None,
            })
            .collect()
    }

    pub fn closes(&self) -> usize {
        self.seen()
            .iter()
            .filter(|s| matches!(s, Seen::Close(_)))
            .count()
    }
}

#[async_trait]
impl Connector for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, PoolError> {
        match self.fault {
            Some(Fault::Connect) => return Err(PoolError::Connect("connection refused".into())),
            Some(Fault::Panic) => panic!("connector exploded"),
            _ => {}
        }
        let id = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let lookups: HashMap<String, Vec<Row>> = self.lookups.iter().cloned().collect();
        Ok(Box::new(ScriptedConn {
            id,
            seen: self.seen.clone(),
            gate: self.gate.clone(),
            lookups,
            fault: self.fault.clone(),
            inserts: self.inserts.clone(),
        }))
    }
}

struct ScriptedConn {
    id: u64,
    seen: Arc<Mutex<Vec<Seen>>>,
    gate: Arc<Semaphore>,
    lookups: HashMap<String, Vec<Row>>,
    fault: Option<Fault>,
    inserts: Arc<AtomicU64>,
}

#[async_trait]
impl Connection for ScriptedConn {
    fn id(&self) -> u64 {
        self.id
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult, PoolError> {
        let _pass = self.gate.acquire().await.map_err(|_| PoolError::Closed)?;
        self.seen.lock().unwrap().push(Seen::Query(sql.to_string()));
        if let Some(Fault::Query(needle)) = &self.fault {
            if sql.contains(needle.as_str()) {
                return Err(PoolError::Query(format!("rejected: {needle}")));
            }
        }
        let mut result = QueryResult::default();
        let head = sql.trim_start().to_ascii_lowercase();
        if head.starts_with("insert") || head.starts_with("replace") {
            let withheld = matches!(&self.fault, Some(Fault::NoInsertId(n)) if sql.contains(n.as_str()));
            if !withheld {
                result.insert_id = Some(self.inserts.fetch_add(1, Ordering::SeqCst) + 1);
            }
            result.affected_rows = 1;
        } else if head.starts_with("select") {
            if let Some((_, rows)) = self.lookups.iter().find(|(needle, _)| sql.contains(needle.as_str())) {
                result.rows = rows.clone();
            }
        }
        Ok(result)
    }

    async fn close(&mut self) -> Result<(), PoolError> {
        self.seen.lock().unwrap().push(Seen::Close(self.id));
        Ok(())
    }
}

/// Store serving a fixed document list, optionally followed by a cursor
/// error, and recording marks.
pub struct MemoryStore {
    docs: Vec<Value>,
    fail_at_end: bool,
    pub marks: Arc<Mutex<Vec<(String, MarkInfo)>>>,
    pub closed: AtomicBool,
}

impl MemoryStore {
    pub fn new(docs: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            docs,
            fail_at_end: false,
            marks: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        })
    }

    pub fn failing(docs: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            docs,
            fail_at_end: true,
            marks: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        })
    }

    pub fn marked(&self) -> Vec<String> {
        self.marks.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find(
        &self,
        _query: &Map<String, Value>,
        _sort: Option<&Map<String, Value>>,
    ) -> Result<DocumentStream, SourceError> {
        let mut items: Vec<Result<Value, SourceError>> = self.docs.iter().cloned().map(Ok).collect();
        if self.fail_at_end {
            items.push(Err(SourceError::InvalidQuery("cursor lost".into())));
        }
        Ok(futures::stream::iter(items).boxed())
    }

    async fn ensure_index(&self, _fields: &[String]) -> Result<(), SourceError> {
        Ok(())
    }

    async fn mark_as_processed(&self, id: &str, info: &MarkInfo) -> Result<(), SourceError> {
        self.marks.lock().unwrap().push((id.to_string(), info.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Schema with one fact table, a required dimension and a looked-up person id.
pub const SCHEMA: &str = r#"
tables:
  job: { schema: modw, unique: [local_job_id] }
fields:
  local_job_id: { type: uint32, nullable: false, table: job }
  username: { type: string }
derived_fields:
  person_id:
    type: int32
    def: -1
    table: job
    query: "SELECT person_id FROM modw.person WHERE username = :username"
    cacheable: true
"#;
