//! Connector that prints statements instead of executing them.
//!
//! Every statement of a query is written on its own line, terminated by
//! `;`. Inserts are given increasing ids so the fact row / error row pairing
//! still works; lookups return no rows.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::pool::{Connection, Connector, PoolError, QueryResult};

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

pub struct StdoutConnector {
    id: String,
    out: SharedWriter,
    sessions: AtomicU64,
    inserts: Arc<AtomicU64>,
}

impl StdoutConnector {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_writer(id, Box::new(std::io::stdout()))
    }

    pub fn with_writer(id: impl Into<String>, out: Box<dyn Write + Send>) -> Self {
        Self {
            id: id.into(),
            out: Arc::new(Mutex::new(out)),
            sessions: AtomicU64::new(0),
            inserts: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl Connector for StdoutConnector {
    fn name(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, PoolError> {
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(StdoutConnection {
            session,
            out: self.out.clone(),
            inserts: self.inserts.clone(),
        }))
    }
}

struct StdoutConnection {
    session: u64,
    out: SharedWriter,
    inserts: Arc<AtomicU64>,
}

fn is_insert(statement: &str) -> bool {
    let head = statement.trim_start().to_ascii_lowercase();
    head.starts_with("insert") || head.starts_with("replace")
}

/// Split `sql` on `;` outside quoted literals and identifiers.
fn statements(sql: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in sql.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if matches!(c, '\'' | '"' | '`') => quote = Some(c),
            None if c == ';' => {
                parts.push(&sql[start..i]);
                start = i + 1;
            }
            None => {}
        }
    }
    parts.push(&sql[start..]);
    parts
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[async_trait]
impl Connection for StdoutConnection {
    fn id(&self) -> u64 {
        self.session
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult, PoolError> {
        let mut result = QueryResult::default();
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        for statement in statements(sql) {
            writeln!(out, "{statement};")
                .map_err(|e| PoolError::Query(e.to_string()))?;
            if is_insert(statement) {
                result.insert_id = Some(self.inserts.fetch_add(1, Ordering::SeqCst) + 1);
                result.affected_rows += 1;
            }
        }
        out.flush().map_err(|e| PoolError::Query(e.to_string()))?;
        Ok(result)
    }

    async fn close(&mut self) -> Result<(), PoolError> {
        debug!(session = self.session, "stdout session closed");
        Ok(())
    }
}
