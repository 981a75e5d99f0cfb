//! Streaming load of one dataset.
//!
//! A [`DatasetProcessor`] reads its dataset's documents from a
//! [`DocumentStore`] and, for each one: transforms it, runs the dimension
//! inserts, resolves derived fields, writes the fact row and its error row,
//! then optionally marks the source document processed.
//!
//! Documents run concurrently inside a single task. The number in flight is
//! capped by an adaptive [`Window`]; the stream is not polled while the cap is
//! reached. The run only finishes once the stream has ended, every in-flight
//! document has completed and every pending mark has returned; only then are
//! the pool and the store closed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use jobetl_core::cache::VolatileCache;
use jobetl_core::config::{InputSpec, ProcessorConfig};
use jobetl_core::run_log::IndexTracker;
use jobetl_core::schema::DerivedField;
use jobetl_core::stats::{ProcessingDetails, ProcessingStats, Profiling};
use jobetl_core::{sql, Emitter, MetricErrors};
use jobetl_tx::{DatasetMap, DynamicTable, TransformedRecord};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::{Pool, PooledConnection};
use crate::source::{
    decode_url_keys, document_id, pending_query, shard_key, DocumentStore, DocumentStream, MarkInfo,
    SourceError,
};

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("dataset \"{dataset}\" writes to several tables ({}), multi table insert is not supported", tables.join(", "))]
    MultiTable { dataset: String, tables: Vec<String> },
    #[error("dataset \"{0}\" has no main table to insert into")]
    NoTable(String),
    #[error("dataset \"{dataset}\": {source}")]
    Table {
        dataset: String,
        #[source]
        source: jobetl_tx::TableError,
    },
}

/// Profile-level settings a processor runs with.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub profile_name: String,
    pub profile_version: String,
    pub config: ProcessorConfig,
    /// Field whose min/max over inserted rows is reported.
    pub index_field: Option<String>,
}

/// In-flight document cap, adjusted like a TCP window: it grows while
/// nobody waits on the pool and shrinks while somebody does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    current: usize,
    min: usize,
    max: usize,
}

impl Window {
    pub fn new(config: &ProcessorConfig) -> Self {
        let min = config.min_window.max(1);
        let max = config.max_window.max(min);
        Self {
            current: config.initial_window.clamp(min, max),
            min,
            max,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn adjust(&mut self, queue_len: usize) {
        if queue_len == 0 && self.current < self.max {
            self.current += 1;
        } else if queue_len > 0 && self.current > self.min {
            self.current -= 1;
        }
    }
}

/// Final state of a dataset run.
#[derive(Debug, Clone)]
pub struct DatasetReport {
    pub details: ProcessingDetails,
    /// A dataset-level error (source or store failure) ended the run.
    pub failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Transform,
    PoolConnect,
    DimInsert,
    Derived,
    Insert,
}

impl Stage {
    fn key(self) -> &'static str {
        match self {
            Stage::Transform => "transform",
            Stage::PoolConnect => "pool",
            Stage::DimInsert => "dim_insert",
            Stage::Derived => "derived",
            Stage::Insert => "insert",
        }
    }
}

struct Failure {
    stage: Stage,
    message: String,
}

impl Failure {
    fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// What one document's processing produced.
struct DocOutcome {
    id: Option<String>,
    started: Instant,
    failed: Option<Stage>,
    warned: bool,
    errors: BTreeMap<String, Vec<String>>,
    warnings: BTreeMap<String, Vec<String>>,
    profiling: Profiling,
    /// Values of the inserted fact row.
    row: Option<Map<String, Value>>,
}

impl DocOutcome {
    fn new(id: Option<String>, started: Instant) -> Self {
        Self {
            id,
            started,
            failed: None,
            warned: false,
            errors: BTreeMap::new(),
            warnings: BTreeMap::new(),
            profiling: Profiling::default(),
            row: None,
        }
    }

    fn fail(&mut self, failure: Failure) {
        self.failed = Some(failure.stage);
        self.errors
            .entry(failure.stage.key().to_string())
            .or_default()
            .push(failure.message);
    }
}

struct MarkDone {
    outcome: DocOutcome,
    elapsed: f64,
    error: Option<SourceError>,
}

type Caches = Mutex<HashMap<u64, VolatileCache>>;

pub struct DatasetProcessor {
    name: String,
    map: Arc<DatasetMap>,
    table: DynamicTable,
    insert_template: String,
    error_insert_template: String,
    input: InputSpec,
    store: Arc<dyn DocumentStore>,
    pool: Arc<Pool>,
    settings: ProcessorSettings,
    emitter: Emitter,
    shutdown: CancellationToken,
}

impl DatasetProcessor {
    pub fn new(
        map: Arc<DatasetMap>,
        input: InputSpec,
        store: Arc<dyn DocumentStore>,
        pool: Arc<Pool>,
        settings: ProcessorSettings,
        emitter: Emitter,
    ) -> Result<Self, ProcessorError> {
        let name = map.name().to_string();
        let mut tables = map.tables();
        if tables.len() > 1 {
            return Err(ProcessorError::MultiTable {
                dataset: name,
                tables: tables.into_keys().collect(),
            });
        }
        let Some((_, table)) = tables.pop_first() else {
            return Err(ProcessorError::NoTable(name));
        };
        for column in table.columns.values() {
            column.sql_type().map_err(|e| ProcessorError::Table {
                dataset: name.clone(),
                source: jobetl_tx::TableError::ColumnType {
                    table: table.name.clone(),
                    column: column.name.clone(),
                    source: e,
                },
            })?;
        }
        let insert_template = table.insert_statement(true, false, &settings.profile_version);
        let error_insert_template =
            table.error_insert_statement(true, false, &settings.profile_version);
        Ok(Self {
            name,
            map,
            table,
            insert_template,
            error_insert_template,
            input,
            store,
            pool,
            settings,
            emitter,
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop reading new documents once `token` is cancelled. Documents
    /// already in flight still complete.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    pub async fn run(self) -> DatasetReport {
        let clock = Instant::now();
        let config = &self.settings.config;
        let mut stats = ProcessingStats::new();
        let mut window = Window::new(config);
        let mut index = IndexTracker::new(self.settings.index_field.clone());
        let caches: Caches = Mutex::new(HashMap::new());
        let mut failed = false;

        let mut stream = match self.open_stream().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                self.emitter.error(format!("source open error: {e}"));
                failed = true;
                None
            }
        };
        let mut ended = stream.is_none();

        let mut in_flight: FuturesUnordered<BoxFuture<'_, DocOutcome>> = FuturesUnordered::new();
        let mut marking: FuturesUnordered<BoxFuture<'_, MarkDone>> = FuturesUnordered::new();

        loop {
            tokio::select! {
                biased;

                Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                    stats.currently_processing = in_flight.len();
                    self.count(&mut stats, &mut index, &outcome);
                    if config.mark_processed && outcome.id.is_some() {
                        stats.currently_marking += 1;
                        marking.push(self.mark(outcome).boxed());
                    } else {
                        let good = outcome.failed.is_none();
                        self.finish(&mut stats, &mut window, &caches, &outcome, good, ended, clock);
                    }
                }

                Some(done) = marking.next(), if !marking.is_empty() => {
                    stats.currently_marking -= 1;
                    stats.profiling.mark += done.elapsed;
                    if let Some(e) = &done.error {
                        self.emitter.error(format!(
                            "error marking processed doc {}: {e}",
                            done.outcome.id.as_deref().unwrap_or_default()
                        ));
                    }
                    let good = done.outcome.failed.is_none() && done.error.is_none();
                    self.finish(&mut stats, &mut window, &caches, &done.outcome, good, ended, clock);
                }

                _ = self.shutdown.cancelled(), if !ended => {
                    self.emitter.message("shutdown requested, draining in-flight documents");
                    ended = true;
                }

                item = next_doc(&mut stream), if !ended && in_flight.len() < window.current() => {
                    match item {
                        Some(Ok(doc)) => match self.admit(doc) {
                            Some(doc) => {
                                in_flight.push(self.process_doc(doc, &caches).boxed());
                                stats.currently_processing = in_flight.len();
                            }
                            None => stats.other_shard += 1,
                        },
                        Some(Err(e)) => {
                            self.emitter.error(format!("Stream Error: {e}"));
                            failed = true;
                            ended = true;
                        }
                        None => {
                            self.emitter.message("Stream End");
                            ended = true;
                        }
                    }
                }

                else => break,
            }
        }

        drop(stream);
        self.close().await;
        stats.currently_processing = 0;
        stats.base.min_index = index.min;
        stats.base.max_index = index.max;
        let details = self.details(&stats, &window, clock);
        info!(dataset = %self.name, processed = details.stats.base.processed, good = details.stats.base.good, failed, "dataset finished");
        DatasetReport { details, failed }
    }

    async fn open_stream(&self) -> Result<DocumentStream, SourceError> {
        let query = pending_query(
            &self.input,
            &self.settings.profile_name,
            &self.settings.profile_version,
        );
        self.emitter
            .message(format!("connected to document store '{}'", self.store.name()));
        let fields: Vec<String> = query.keys().cloned().collect();
        self.store.ensure_index(&fields).await?;
        self.emitter.message(format!(
            "query '{}' {}",
            self.input.config.collection,
            Value::Object(query.clone())
        ));
        self.store.find(&query, self.input.sort.as_ref()).await
    }

    /// Apply the shard filter and the key decoding pass.
    fn admit(&self, doc: Value) -> Option<Value> {
        if let Some(shard) = &self.settings.config.shard {
            let id = document_id(&doc).unwrap_or_default();
            if !shard.accepts(shard_key(&id)) {
                debug!(dataset = %self.name, id, "document belongs to another shard");
                return None;
            }
        }
        if self.input.config.url_encoded_keys {
            return Some(decode_url_keys(doc));
        }
        Some(doc)
    }

    fn count(&self, stats: &mut ProcessingStats, index: &mut IndexTracker, outcome: &DocOutcome) {
        let base = &mut stats.base;
        if outcome.warned {
            base.transform_warning_count += 1;
        }
        match outcome.failed {
            Some(Stage::Transform) => base.transform_error_count += 1,
            Some(Stage::PoolConnect) => base.pool_connect_error_count += 1,
            Some(Stage::DimInsert) => base.dim_insert_error_count += 1,
            Some(Stage::Derived) => base.derived_error_count += 1,
            Some(Stage::Insert) => base.insert_error_count += 1,
            None => {}
        }
        stats.profiling.merge(&outcome.profiling);
        if let Some(row) = &outcome.row {
            index.observe(row);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        stats: &mut ProcessingStats,
        window: &mut Window,
        caches: &Caches,
        outcome: &DocOutcome,
        good: bool,
        ended: bool,
        clock: Instant,
    ) {
        let config = &self.settings.config;
        if good {
            stats.base.good += 1;
        }
        stats.base.processed += 1;
        Profiling::add(&mut stats.profiling.total, outcome.started);

        let processed = stats.base.processed;
        if ended || config.print_every == 0 || processed % config.print_every != 0 {
            return;
        }
        if config.cache_check_every > 0 && processed % config.cache_check_every == 0 {
            let mut caches = caches.lock().unwrap_or_else(|p| p.into_inner());
            for (conn, cache) in caches.iter_mut() {
                if cache.len() > config.cache_capacity {
                    debug!(dataset = %self.name, conn, entries = cache.len(), "clearing volatile cache");
                    cache.clear();
                }
            }
        }
        window.adjust(self.pool.queue_len());
        self.emitter.message(self.details(stats, window, clock).render());
    }

    fn details(&self, stats: &ProcessingStats, window: &Window, clock: Instant) -> ProcessingDetails {
        let t = clock.elapsed().as_secs_f64();
        ProcessingDetails {
            etl_profile_name: self.settings.profile_name.clone(),
            etl_profile_version: self.settings.profile_version.clone(),
            dataset: self.name.clone(),
            stats: stats.clone(),
            t,
            output_queue: self.pool.queue_len(),
            rate: if t > 0.0 {
                stats.base.processed as f64 / t
            } else {
                0.0
            },
            max_processing: window.current(),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pool.end().await {
            self.emitter.error(format!("pool end error: {e}"));
        }
        self.emitter.message("pool closed");
        if let Err(e) = self.store.close().await {
            self.emitter.error(format!("document store close error: {e}"));
        }
        self.emitter.message("document store closed");
    }

    async fn mark(&self, outcome: DocOutcome) -> MarkDone {
        let start = Instant::now();
        let info = MarkInfo {
            profile: self.settings.profile_name.clone(),
            version: self.settings.profile_version.clone(),
            errors: outcome.errors.clone(),
            warnings: outcome.warnings.clone(),
        };
        let id = outcome.id.clone().unwrap_or_default();
        let error = self.store.mark_as_processed(&id, &info).await.err();
        let mut elapsed = 0.0;
        Profiling::add(&mut elapsed, start);
        MarkDone {
            outcome,
            elapsed,
            error,
        }
    }

    async fn process_doc(&self, doc: Value, caches: &Caches) -> DocOutcome {
        let mut out = DocOutcome::new(document_id(&doc), Instant::now());
        let label = out.id.clone().unwrap_or_else(|| "<no _id>".to_string());

        let t = Instant::now();
        let record = self.map.transform(&doc);
        Profiling::add(&mut out.profiling.trans, t);
        if record.has_errors() {
            self.emitter.error(format!(
                "Error(s) occurred during transform step for doc {label}: {:?}",
                record.errors
            ));
            out.failed = Some(Stage::Transform);
            out.errors = record.errors;
            return out;
        }
        if record.has_warnings() {
            self.emitter.error(format!(
                "Warning(s) encountered during transform step for doc {label}: {:?}",
                record.warnings
            ));
            out.warned = true;
            out.warnings = record.warnings.clone();
        }

        let t = Instant::now();
        let mut derived = self.map.schema().derived_fields(&record.values());
        Profiling::add(&mut out.profiling.df, t);

        let t = Instant::now();
        let acquired = self.pool.acquire().await;
        Profiling::add(&mut out.profiling.get_conn, t);
        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(e) => {
                self.emitter.error(format!("pool getConnection error: {e}"));
                out.fail(Failure::new(Stage::PoolConnect, e.to_string()));
                return out;
            }
        };

        let conn_id = conn.id();
        let mut cache = caches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&conn_id)
            .unwrap_or_default();
        let loaded = self
            .load(&mut conn, &mut cache, &record, &mut derived, &mut out.profiling)
            .await;
        caches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(conn_id, cache);

        let t = Instant::now();
        conn.release();
        Profiling::add(&mut out.profiling.rel_conn, t);

        match loaded {
            Ok(row) => out.row = Some(row),
            Err(failure) => {
                self.emitter.error(format!("doc {label}: {}", failure.message));
                out.fail(failure);
            }
        }
        out
    }

    /// Everything that runs on the document's connection.
    async fn load(
        &self,
        conn: &mut PooledConnection,
        cache: &mut VolatileCache,
        record: &TransformedRecord,
        derived: &mut BTreeMap<String, DerivedField>,
        prof: &mut Profiling,
    ) -> Result<Map<String, Value>, Failure> {
        let t = Instant::now();
        let statements = self.map.dimension_insert_statements(record, cache);
        Profiling::add(&mut prof.is, t);

        let t = Instant::now();
        let batch = self.settings.config.statement_batch.max(1);
        for chunk in statements.chunks(batch) {
            if let Err(e) = conn.query(&chunk.join("; ")).await {
                Profiling::add(&mut prof.dim_insert, t);
                return Err(Failure::new(
                    Stage::DimInsert,
                    format!("Dim Insert Error: {e}: {chunk:?}"),
                ));
            }
        }
        Profiling::add(&mut prof.dim_insert, t);

        let t = Instant::now();
        self.resolve_derived(conn, cache, derived).await;
        Profiling::add(&mut prof.der_fields, t);

        let t = Instant::now();
        let (values, mut errors) = row_values(record, derived)?;
        Profiling::add(&mut prof.rec_prep, t);

        let t = Instant::now();
        let insert = sql::query_format_map(&self.insert_template, &values);
        let result = conn.query(&insert).await;
        Profiling::add(&mut prof.insert_doc, t);
        let id = match result {
            Err(e) => return Err(Failure::new(Stage::Insert, format!("{e}: insertStatement: {insert}"))),
            Ok(result) => match result.insert_id {
                Some(id) if id > 0 => id,
                _ => {
                    return Err(Failure::new(
                        Stage::Insert,
                        format!("insert id undefined: insertStatement: {insert}"),
                    ))
                }
            },
        };

        errors.insert("_id".into(), Value::from(id));
        let t = Instant::now();
        let error_insert = sql::query_format_map(&self.error_insert_template, &errors);
        let result = conn.query(&error_insert).await;
        Profiling::add(&mut prof.insert_error, t);
        if let Err(e) = result {
            return Err(Failure::new(
                Stage::Insert,
                format!("{e}: errorInsertStatement: {error_insert}"),
            ));
        }
        Ok(values)
    }

    /// Run each pending lookup in turn. A single result row fills every
    /// derived field named by its columns, so later lookups may be skipped.
    async fn resolve_derived(
        &self,
        conn: &mut PooledConnection,
        cache: &mut VolatileCache,
        derived: &mut BTreeMap<String, DerivedField>,
    ) {
        let names: Vec<String> = derived.keys().cloned().collect();
        for name in names {
            let (query, cacheable) = match derived.get(&name) {
                Some(field) if field.value.is_none() => match &field.query {
                    Some(query) => (query.clone(), field.cacheable),
                    None => continue,
                },
                _ => continue,
            };

            let cached = if cacheable {
                cache.rows(&query).map(|rows| rows.to_vec())
            } else {
                None
            };
            let rows = match cached {
                Some(rows) => Ok(rows),
                None => conn.query(&query).await.map(|r| r.rows),
            };

            match rows {
                Err(e) => {
                    if let Some(field) = derived.get_mut(&name) {
                        field.error |= MetricErrors::DERIVE_QUERY_ERROR;
                    }
                    self.emitter.error(format!("{e}: {query}"));
                }
                Ok(rows) if rows.len() == 1 => {
                    for (column, value) in &rows[0] {
                        match derived.get_mut(column) {
                            Some(target) => {
                                target.value = Some(value.clone());
                                target.error = MetricErrors::OK;
                            }
                            None => debug!(dataset = %self.name, column, "lookup column is not a derived field"),
                        }
                    }
                    if cacheable {
                        cache.put_rows(query, rows);
                    }
                }
                Ok(rows) if rows.is_empty() => {
                    if let Some(field) = derived.get_mut(&name) {
                        field.error |= MetricErrors::DERIVE_QUERY_ERROR;
                    }
                    debug!(dataset = %self.name, field = %name, "lookup returned no rows");
                }
                Ok(rows) => {
                    if let Some(field) = derived.get_mut(&name) {
                        field.error |= MetricErrors::AMBIGUOUS;
                    }
                    self.emitter.warning(format!(
                        "non-unique foreign key - {} rows returned for: {query}",
                        rows.len()
                    ));
                }
            }
        }
    }
}

/// Fact and error row bindings. Required dimensions carry their value in the
/// error row, every other column its error code.
fn row_values(
    record: &TransformedRecord,
    derived: &BTreeMap<String, DerivedField>,
) -> Result<(Map<String, Value>, Map<String, Value>), Failure> {
    let mut values = Map::new();
    let mut errors = Map::new();
    for (name, field) in derived {
        let schema_field = &field.schema_field;
        let value = field.value.clone().unwrap_or_else(|| schema_field.def.clone());
        if value.is_null() && !schema_field.nullable {
            return Err(Failure::new(
                Stage::Derived,
                format!("Attribute \"{name}\" cannot be null: {:?}", field.query),
            ));
        }
        let error = if schema_field.is_required_dimension() {
            value.clone()
        } else {
            Value::from(field.error.bits())
        };
        errors.insert(name.clone(), error);
        values.insert(name.clone(), value);
    }
    for (name, data) in &record.data {
        let required = record
            .schema
            .get(name)
            .is_some_and(|f| f.is_required_dimension());
        let error = if required {
            data.value.clone()
        } else {
            Value::from(data.error.bits())
        };
        values.insert(name.clone(), data.value.clone());
        errors.insert(name.clone(), error);
    }
    Ok((values, errors))
}

async fn next_doc(
    stream: &mut Option<DocumentStream>,
) -> Option<Result<Value, SourceError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial: usize) -> ProcessorConfig {
        ProcessorConfig {
            initial_window: initial,
            ..ProcessorConfig::default()
        }
    }

    #[test]
    fn window_grows_to_ceiling() {
        let mut w = Window::new(&config(2));
        let mut last = w.current();
        for _ in 0..10 {
            w.adjust(0);
            assert!(w.current() >= last);
            assert!(w.current() <= 4);
            last = w.current();
        }
        assert_eq!(w.current(), 4);
    }

    #[test]
    fn window_shrinks_to_floor() {
        let mut w = Window::new(&config(4));
        let mut last = w.current();
        for queue in [1, 5, 2, 9, 1, 1] {
            w.adjust(queue);
            assert!(w.current() <= last);
            assert!(w.current() >= 1);
            last = w.current();
        }
        assert_eq!(w.current(), 1);
    }

    #[test]
    fn initial_window_is_clamped() {
        assert_eq!(Window::new(&config(0)).current(), 1);
        assert_eq!(Window::new(&config(40)).current(), 4);
    }
}
