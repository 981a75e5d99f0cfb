//! Record transforms and the generators fed by the schema.
//!
//! [`DatasetMap`] turns one source document into a [`TransformedRecord`],
//! with profile-declared [`formulas`] alongside the ones registered in code.
//! The rest of the crate derives things from the schema and mappings
//! without touching a live pipeline: table DDL and insert templates
//! ([`DynamicTable`]), aggregation tables and their ETL definitions
//! ([`etlv2`]), analytics engine integration files ([`integration`]) and
//! table documentation ([`docs`]).

pub mod aggregation;
pub mod compare;
pub mod dataset_map;
pub mod docs;
pub mod dynamic_table;
pub mod etlv2;
pub mod formulas;
pub mod integration;

pub use aggregation::{aggregation_tables, AggregationColumn, AggregationTable};
pub use dataset_map::{DatasetMap, FieldValue, TransformedRecord};
pub use dynamic_table::{dynamic_tables, DynamicTable, TableError};
pub use integration::{Integration, IntegrationError, IntegrationPaths, SourceTemplate, SourceTemplates};
