//! # jobetl I/O - Sources, Pool, Processors and Profiles
//!
//! Runtime side of the jobetl pipeline: where documents come from, how rows
//! reach the relational store, and how a profile's datasets are run.
//!
//! ## Features
//!
//! ### Document sources
//! - **JSON lines**: one `<collection>.jsonl` file per dataset with a
//!   processed-marks ledger next to it
//! - **Query subset**: equality and comparison operators, multi-key sort
//!
//! ### Output
//! - **Connection pool**: bounded, with a wait queue that drives the
//!   processor's adaptive window
//! - **Stdout connector**: prints every statement, for dry runs and table
//!   creation scripts
//! - **Run log**: one row per finished dataset on a dedicated connection
//!
//! ### Orchestration
//! - **Dataset processor**: windowed concurrent load with drain-before-close
//! - **Profile**: concurrent datasets, sharding, DDL, documentation,
//!   aggregation definitions, integration files and regression fixtures
//!
//! ## Example Usage
//!
//! ```no_run
//! use jobetl_core::{FormulaRegistry, ProfileSpec};
//! use jobetl_io::profile::EtlProfile;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let spec = ProfileSpec::load("profiles/supremm.yaml")?;
//! let profile = EtlProfile::new(spec, FormulaRegistry::new(), None)?;
//! let report = profile.process_all().await?;
//! println!("processed {}", report.total.processed);
//! # Ok(())
//! # }
//! ```

/// Bounded connection pool and the connector traits
pub mod pool;

/// Streaming load of one dataset
pub mod processor;

/// Profile orchestration and offline generators
pub mod profile;

/// Regression fixture runner
pub mod regression;

/// Run-log persistence
pub mod run_log;

/// Statement-printing connector
pub mod sink_stdout;

/// Document store trait and helpers
pub mod source;

/// JSON lines document store
pub mod source_jsonl;

pub use pool::{Connection, Connector, Pool, PoolError, PooledConnection, QueryResult};
pub use processor::{DatasetProcessor, DatasetReport, ProcessorError, ProcessorSettings, Window};
pub use profile::{EtlProfile, OutputMode, ProfileError, ProfileReport};
pub use source::{DocumentStore, MarkInfo, SourceError};
