//! Per-connection volatile cache.
//!
//! Rows inserted on one session are not guaranteed to be visible to other
//! sessions straight away, so each pooled connection has its own cache of
//! dimension statements it already executed and lookup rows it already
//! fetched. A cache is only ever used by the connection that filled it.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

pub type Row = Map<String, Value>;

#[derive(Debug, Default, Clone)]
pub struct VolatileCache {
    statements: HashSet<String>,
    rows: HashMap<String, Vec<Row>>,
}

impl VolatileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `statement`. Returns false if it was already cached.
    pub fn insert_statement(&mut self, statement: &str) -> bool {
        if self.statements.contains(statement) {
            return false;
        }
        self.statements.insert(statement.to_string())
    }

    pub fn rows(&self, query: &str) -> Option<&[Row]> {
        self.rows.get(query).map(Vec::as_slice)
    }

    pub fn put_rows(&mut self, query: impl Into<String>, rows: Vec<Row>) {
        self.rows.insert(query.into(), rows);
    }

    pub fn len(&self) -> usize {
        self.statements.len() + self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.statements.clear();
        self.rows.clear();
    }
}
