//! Profile orchestration.
//!
//! An [`EtlProfile`] owns the schema, one [`DatasetMap`] per enabled dataset
//! and the output connector. It runs the datasets concurrently, one task per
//! dataset, and drives the offline generators (DDL, documentation, ETL
//! definitions, integration files, regression fixtures).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use jobetl_core::config::LogStoreSpec;
use jobetl_core::mapping::MappingError;
use jobetl_core::run_log::LogError;
use jobetl_core::schema::{RawStatisticsSpec, TableDefinition};
use jobetl_core::stats::ProcessingStats;
use jobetl_core::{
    BaseStats, Emitter, EtlEvent, EventTx, FormulaRegistry, OutputSpec, ProcessingDetails,
    ProfileSpec, RunLogEntry, Schema, SchemaError,
};
use jobetl_tx::integration::raw_statistics_configuration;
use jobetl_tx::{
    aggregation_tables, docs, etlv2, AggregationTable, DatasetMap, DynamicTable, Integration,
    IntegrationPaths, SourceTemplates, TableError,
};
use serde_json::Map;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pool::{Connector, Pool, PoolError};
use crate::processor::{DatasetProcessor, DatasetReport, ProcessorError, ProcessorSettings};
use crate::regression::{run_fixtures, FixtureResult};
use crate::run_log::RunLogStore;
use crate::sink_stdout::StdoutConnector;
use crate::source::{open_store, SourceError};

/// The only SQL dialect rows are generated for.
pub const OUTPUT_ENGINE: &str = "mysqldb";

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("dataset \"{dataset}\": {source}")]
    Mapping {
        dataset: String,
        #[source]
        source: MappingError,
    },
    #[error("{0} is an unsupported output dbEngine")]
    UnsupportedOutputEngine(String),
    #[error("unknown output driver \"{0}\"")]
    UnknownDriver(String),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("dimension table \"{0}\" is not static, only static dimension tables can be created")]
    DynamicDimensionTable(String),
    #[error("run log: {0}")]
    Log(#[from] LogError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Where [`EtlProfile::create_output_tables`] sends its statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Execute on a connection of the output connector.
    Sql,
    /// Return the statements as text.
    Stdout,
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sql" => Ok(Self::Sql),
            "stdout" => Ok(Self::Stdout),
            other => Err(format!("unsupported output mode \"{other}\"")),
        }
    }
}

/// Every dataset's report plus the combined counters.
#[derive(Debug, Clone, Default)]
pub struct ProfileReport {
    pub datasets: Vec<DatasetReport>,
    pub total: BaseStats,
}

impl ProfileReport {
    pub fn failed(&self) -> bool {
        self.datasets.iter().any(|d| d.failed)
    }
}

/// Built-in connector for `output.config.driver` (default `stdout`).
pub fn connector_for(output: &OutputSpec) -> Result<Arc<dyn Connector>, ProfileError> {
    let driver = output
        .config
        .get("driver")
        .and_then(|d| d.as_str())
        .unwrap_or("stdout");
    match driver {
        "stdout" => Ok(Arc::new(StdoutConnector::new("stdout"))),
        other => Err(ProfileError::UnknownDriver(other.to_string())),
    }
}

pub struct EtlProfile {
    spec: ProfileSpec,
    schema: Arc<Schema>,
    maps: Vec<Arc<DatasetMap>>,
    connector: Arc<dyn Connector>,
    events: Option<EventTx>,
    emitter: Emitter,
    shutdown: CancellationToken,
}

impl EtlProfile {
    /// Build the schema and validate every enabled dataset's mapping.
    /// Disabled datasets are dropped. Formulas declared in the profile are
    /// added to `formulas` unless a closure of the same name is registered.
    pub fn new(
        mut spec: ProfileSpec,
        mut formulas: FormulaRegistry,
        events: Option<EventTx>,
    ) -> Result<Self, ProfileError> {
        spec.datasets.retain(|d| d.enabled);
        jobetl_tx::formulas::register(&mut formulas, &spec.formulas);
        let schema = Arc::new(Schema::new(spec.schema.clone())?);
        let mut maps = Vec::with_capacity(spec.datasets.len());
        for dataset in &spec.datasets {
            let map = DatasetMap::new(schema.clone(), dataset, formulas.clone()).map_err(|source| {
                ProfileError::Mapping {
                    dataset: dataset.name.clone(),
                    source,
                }
            })?;
            maps.push(Arc::new(map));
        }
        let connector = connector_for(&spec.output)?;
        let emitter = Emitter::new(spec.name.clone(), events.clone());
        info!(profile = %spec.name, version = %spec.version, datasets = maps.len(), "profile loaded");
        Ok(Self {
            spec,
            schema,
            maps,
            connector,
            events,
            emitter,
            shutdown: CancellationToken::new(),
        })
    }

    /// Write through `connector` instead of the configured driver.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn version(&self) -> &str {
        &self.spec.version
    }

    pub fn spec(&self) -> &ProfileSpec {
        &self.spec
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn dataset_maps(&self) -> &[Arc<DatasetMap>] {
        &self.maps
    }

    /// Output must be the supported dialect and every dataset must write to
    /// exactly one table. Configured run log values must use known keys.
    pub fn check(&self) -> Result<(), ProfileError> {
        self.require_output_engine()?;
        for map in &self.maps {
            let tables = map.tables();
            if tables.len() > 1 {
                return Err(ProcessorError::MultiTable {
                    dataset: map.name().to_string(),
                    tables: tables.into_keys().collect(),
                }
                .into());
            }
            if tables.is_empty() {
                return Err(ProcessorError::NoTable(map.name().to_string()).into());
            }
        }
        RunLogEntry::from_payload(self.log_extra())?;
        Ok(())
    }

    fn require_output_engine(&self) -> Result<(), ProfileError> {
        if self.spec.output.db_engine != OUTPUT_ENGINE {
            return Err(ProfileError::UnsupportedOutputEngine(
                self.spec.output.db_engine.clone(),
            ));
        }
        Ok(())
    }

    fn log_extra(&self) -> Map<String, serde_json::Value> {
        self.schema
            .spec()
            .etl_logging
            .as_ref()
            .map(|l| l.extra.clone())
            .unwrap_or_default()
    }

    fn index_field(&self) -> Option<String> {
        self.schema
            .spec()
            .etl_logging
            .as_ref()
            .and_then(|l| l.index_field.clone())
    }

    pub async fn process_all(&self) -> Result<ProfileReport, ProfileError> {
        self.process_datasets(None).await
    }

    /// Run the named datasets (all when `names` is `None`) concurrently.
    /// Datasets not named count as completed without being read.
    pub async fn process_datasets(
        &self,
        names: Option<&[String]>,
    ) -> Result<ProfileReport, ProfileError> {
        self.check()?;
        let selected: Option<BTreeSet<&str>> =
            names.map(|n| n.iter().map(String::as_str).collect());
        if let Some(selected) = &selected {
            for name in selected {
                if !self.maps.iter().any(|m| m.name() == *name) {
                    self.emitter
                        .warning(format!("dataset \"{name}\" is not enabled in this profile"));
                }
            }
        }

        let run_log = self
            .spec
            .etl_log
            .clone()
            .map(|spec: LogStoreSpec| RunLogStore::new(self.connector.clone(), spec));

        let mut tasks = JoinSet::new();
        let mut pending = BTreeSet::new();
        let mut report = ProfileReport::default();
        for map in &self.maps {
            let wanted = selected.as_ref().map_or(true, |s| s.contains(map.name()));
            if !wanted {
                info!(dataset = %map.name(), "dataset not selected");
                report.datasets.push(DatasetReport {
                    details: self.empty_details(map.name()),
                    failed: false,
                });
                continue;
            }
            match self.processor(map) {
                Ok(processor) => {
                    pending.insert(map.name().to_string());
                    tasks.spawn(processor.run());
                }
                Err(e) => {
                    self.emitter
                        .scoped(map.name())
                        .error(format!("dataset could not start: {e}"));
                    let failed = DatasetReport {
                        details: self.empty_details(map.name()),
                        failed: true,
                    };
                    self.after_process(&failed, run_log.as_ref()).await?;
                    report.datasets.push(failed);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let done = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(profile = %self.spec.name, error = %e, "dataset task did not complete");
                    self.emitter.error(format!("dataset task failed: {e}"));
                    continue;
                }
            };
            pending.remove(&done.details.dataset);
            self.after_process(&done, run_log.as_ref()).await?;
            report.total.absorb(&done.details.stats.base);
            report.datasets.push(done);
        }

        // Tasks that panicked or were cancelled never returned a report.
        for dataset in pending {
            let lost = DatasetReport {
                details: self.empty_details(&dataset),
                failed: true,
            };
            self.emitter
                .scoped(&dataset)
                .error("dataset ended without a report, its counts are lost");
            self.after_process(&lost, run_log.as_ref()).await?;
            report.datasets.push(lost);
        }

        self.emitter.message(format!(
            "all datasets finished: processed {} good {}",
            report.total.processed, report.total.good
        ));
        if let Some(tx) = &self.events {
            let _ = tx.send(EtlEvent::AfterProcessAll(report.total.clone()));
        }
        Ok(report)
    }

    fn processor(&self, map: &Arc<DatasetMap>) -> Result<DatasetProcessor, ProfileError> {
        let dataset = self
            .spec
            .datasets
            .iter()
            .find(|d| d.name == map.name())
            .ok_or_else(|| ProcessorError::NoTable(map.name().to_string()))?;
        let store = open_store(&dataset.input)?;
        let pool = Pool::new(self.connector.clone(), self.spec.processor.pool_size);
        let settings = ProcessorSettings {
            profile_name: self.spec.name.clone(),
            profile_version: self.spec.version.clone(),
            config: self.spec.processor.clone(),
            index_field: self.index_field(),
        };
        let processor = DatasetProcessor::new(
            map.clone(),
            dataset.input.clone(),
            store,
            pool,
            settings,
            self.emitter.scoped(map.name()),
        )?;
        Ok(processor.with_shutdown(self.shutdown.child_token()))
    }

    fn empty_details(&self, dataset: &str) -> ProcessingDetails {
        ProcessingDetails {
            etl_profile_name: self.spec.name.clone(),
            etl_profile_version: self.spec.version.clone(),
            dataset: dataset.to_string(),
            stats: ProcessingStats::new(),
            t: 0.0,
            output_queue: 0,
            rate: 0.0,
            max_processing: 0,
        }
    }

    /// Build and persist the run log row, then publish the dataset's end.
    async fn after_process(
        &self,
        done: &DatasetReport,
        run_log: Option<&RunLogStore>,
    ) -> Result<(), ProfileError> {
        let dataset = done.details.dataset.clone();
        let log = match run_log {
            Some(store) => {
                let entry = RunLogEntry::from_details(&done.details, Utc::now(), &self.log_extra())?;
                if let Err(e) = store.persist(&entry).await {
                    self.emitter
                        .scoped(&dataset)
                        .error(format!("run log insert failed: {e}"));
                }
                Some(entry)
            }
            None => None,
        };
        if let Some(tx) = &self.events {
            let _ = tx.send(EtlEvent::AfterProcess {
                dataset,
                details: done.details.clone(),
                log,
            });
        }
        Ok(())
    }

    /// Dynamic tables written by any dataset, merged by name.
    pub fn tables(&self) -> BTreeMap<String, DynamicTable> {
        let mut merged: BTreeMap<String, DynamicTable> = BTreeMap::new();
        for map in &self.maps {
            for (name, table) in map.tables() {
                match merged.get_mut(&name) {
                    Some(existing) => existing.columns.extend(table.columns),
                    None => {
                        merged.insert(name, table);
                    }
                }
            }
        }
        merged
    }

    fn attributes(&self) -> Vec<String> {
        let mut names = Vec::new();
        for map in &self.maps {
            for name in map.mapping().attributes().keys() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    pub fn aggregation_tables(&self) -> Result<BTreeMap<String, AggregationTable>, TableError> {
        let attributes = self.attributes();
        aggregation_tables(&self.schema, attributes.iter().map(String::as_str))
    }

    pub fn raw_statistics_configuration(&self) -> Option<RawStatisticsSpec> {
        raw_statistics_configuration(self.schema.spec().raw_statistics.as_ref(), &self.tables())
    }

    /// Population statements of the static dimension tables followed by the
    /// fact and error table DDL.
    pub fn output_table_statements(&self) -> Result<Vec<String>, ProfileError> {
        self.require_output_engine()?;
        let mut statements = Vec::new();
        for (name, table) in &self.schema.spec().dimension_tables {
            if table.definition != TableDefinition::Static {
                return Err(ProfileError::DynamicDimensionTable(name.clone()));
            }
            if let Some(stmt) = &table.import_stmt {
                statements.push(stmt.trim_end_matches(';').to_string());
            }
        }
        for table in self.tables().values() {
            statements.extend(table.create_table_statements()?);
            statements.push(table.create_error_table_statement()?);
        }
        Ok(statements)
    }

    /// Create the output tables. In [`OutputMode::Stdout`] the statements
    /// are returned, joined with `";\n"`, instead of executed.
    pub async fn create_output_tables(
        &self,
        mode: OutputMode,
    ) -> Result<Option<String>, ProfileError> {
        let statements = self.output_table_statements()?;
        match mode {
            OutputMode::Stdout => Ok(Some(statements.join(";\n"))),
            OutputMode::Sql => {
                let mut conn = self.connector.connect().await?;
                let result = conn.query(&statements.join("; ")).await;
                conn.close().await?;
                result?;
                self.emitter
                    .message(format!("created tables with {} statements", statements.len()));
                Ok(None)
            }
        }
    }

    /// HTML documentation page per output table.
    pub fn documentation(&self) -> Vec<String> {
        self.tables()
            .values()
            .map(|table| {
                let database = self
                    .spec
                    .output
                    .config
                    .get("database")
                    .and_then(|d| d.as_str())
                    .unwrap_or(&table.meta.schema);
                docs::table_documentation(database, table)
            })
            .collect()
    }

    /// Write the aggregation and table definition files under the profile
    /// root.
    pub fn aggregate(&self) -> anyhow::Result<Vec<PathBuf>> {
        self.require_output_engine()?;
        let root = &self.spec.root;
        let mut written = etlv2::generate_aggregates(&self.aggregation_tables()?, root)?;
        written.extend(etlv2::generate_table_definitions(&self.tables(), root)?);
        info!(files = written.len(), root = %root.display(), "aggregation definitions written");
        Ok(written)
    }

    /// Write the analytics engine integration files.
    pub fn integrate(
        &self,
        paths: Option<IntegrationPaths>,
        templates: &SourceTemplates,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let paths = paths.unwrap_or_else(|| IntegrationPaths::under(&self.spec.root));
        let tables = self.aggregation_tables()?;
        Integration {
            aggregation_tables: &tables,
            raw_statistics: self.raw_statistics_configuration(),
            group_by_none_roles: self.schema.spec().group_by_none_roles.as_ref(),
            version: &self.spec.version,
            paths: &paths,
            templates,
        }
        .run()
    }

    /// Run every dataset's regression fixtures. Datasets without a fixture
    /// directory are skipped.
    pub fn regression_tests(&self, regenerate: bool) -> anyhow::Result<Vec<FixtureResult>> {
        let mut results = Vec::new();
        for map in &self.maps {
            let dir = self
                .spec
                .datasets
                .iter()
                .find(|d| d.name == map.name())
                .and_then(|d| d.regression_test_dir.as_ref());
            let Some(dir) = dir else {
                warn!(dataset = %map.name(), "no regression test directory");
                continue;
            };
            let dir = if dir.is_relative() {
                self.spec.root.join(dir)
            } else {
                dir.clone()
            };
            let emitter = self.emitter.scoped(map.name());
            results.extend(
                run_fixtures(map, &dir, regenerate, &emitter)
                    .with_context(|| format!("regression tests of {}", map.name()))?,
            );
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_modes_parse() {
        assert_eq!("sql".parse::<OutputMode>(), Ok(OutputMode::Sql));
        assert_eq!("stdout".parse::<OutputMode>(), Ok(OutputMode::Stdout));
        assert!("csv".parse::<OutputMode>().is_err());
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let output = OutputSpec {
            db_engine: OUTPUT_ENGINE.into(),
            config: serde_json::json!({ "driver": "odbc" })
                .as_object()
                .cloned()
                .unwrap_or_default(),
        };
        assert!(matches!(
            connector_for(&output),
            Err(ProfileError::UnknownDriver(d)) if d == "odbc"
        ));
    }
}
