//! # jobetl core
//!
//! Data model and leaf components of the jobetl pipeline: profile and
//! dataset configuration, the target schema and its field resolver, the
//! type validator, metric error codes, declarative mappings, processing
//! statistics and the typed event channel components report through.
//!
//! ## Pipeline
//!
//! ```text
//! source document -> DatasetMap::transform -> TransformedRecord
//!     -> DatasetProcessor (dimension inserts, derived fields, fact/error rows)
//!     -> relational store
//! ```
//!
//! The transform stage lives in `jobetl-tx`, the runtime in `jobetl-io`.

use tokio::sync::mpsc;

pub mod cache;
pub mod config;
pub mod mapping;
pub mod metric_errors;
pub mod run_log;
pub mod schema;
pub mod sorting;
pub mod sql;
pub mod stats;
pub mod types;

pub use config::{DatasetSpec, InputSpec, OutputSpec, ProcessorConfig, ProfileSpec, Shard};
pub use mapping::{FormulaError, FormulaRegistry, Mapping, MappingRule, Resolved};
pub use metric_errors::MetricErrors;
pub use run_log::RunLogEntry;
pub use schema::{Schema, SchemaError, SchemaField};
pub use stats::{BaseStats, ProcessingDetails, ProcessingStats};
pub use types::{FieldType, Severity};

/// Sender side of the event channel shared by pipeline components.
pub type EventTx = mpsc::UnboundedSender<EtlEvent>;

/// Receiver side of the event channel.
pub type EventRx = mpsc::UnboundedReceiver<EtlEvent>;

/// Events published by pipeline components.
///
/// Every component reports progress and per-document problems here in
/// addition to logging them, so that an embedding application can observe a
/// run without scraping logs.
#[derive(Debug, Clone)]
pub enum EtlEvent {
    /// Informational or warning text from `source` (a dataset or profile name).
    Message { source: String, text: String },

    /// A per-document or per-dataset failure.
    Error { source: String, text: String },

    /// One dataset finished. `log` is the run-log row persisted for it, if
    /// run logging is configured.
    AfterProcess {
        dataset: String,
        details: ProcessingDetails,
        log: Option<RunLogEntry>,
    },

    /// Every dataset of the profile finished; carries the combined counters.
    AfterProcessAll(BaseStats),
}

/// Convenience handle that logs through `tracing` and forwards the same
/// text on the event channel when one is attached.
#[derive(Debug, Clone, Default)]
pub struct Emitter {
    source: String,
    tx: Option<EventTx>,
}

impl Emitter {
    pub fn new(source: impl Into<String>, tx: Option<EventTx>) -> Self {
        Self {
            source: source.into(),
            tx,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// A copy of this emitter reporting under a different source name.
    pub fn scoped(&self, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            tx: self.tx.clone(),
        }
    }

    pub fn message(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(source = %self.source, "{text}");
        self.send(EtlEvent::Message {
            source: self.source.clone(),
            text,
        });
    }

    pub fn warning(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::warn!(source = %self.source, "{text}");
        self.send(EtlEvent::Message {
            source: self.source.clone(),
            text,
        });
    }

    pub fn error(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::error!(source = %self.source, "{text}");
        self.send(EtlEvent::Error {
            source: self.source.clone(),
            text,
        });
    }

    /// Publish an event without logging it.
    pub fn send(&self, event: EtlEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(event);
        }
    }
}
