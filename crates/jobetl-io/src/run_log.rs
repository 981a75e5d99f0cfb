//! Run-log persistence.

use std::sync::Arc;

use jobetl_core::config::LogStoreSpec;
use jobetl_core::RunLogEntry;
use tracing::info;

use crate::pool::{Connector, PoolError};

/// Writes one row per finished dataset on a dedicated connection.
pub struct RunLogStore {
    connector: Arc<dyn Connector>,
    spec: LogStoreSpec,
}

impl RunLogStore {
    pub fn new(connector: Arc<dyn Connector>, spec: LogStoreSpec) -> Self {
        Self { connector, spec }
    }

    pub fn spec(&self) -> &LogStoreSpec {
        &self.spec
    }

    pub async fn persist(&self, entry: &RunLogEntry) -> Result<(), PoolError> {
        let statement = entry.insert_statement(&self.spec.database, &self.spec.table);
        let mut conn = self.connector.connect().await?;
        let result = conn.query(&statement).await;
        conn.close().await?;
        result?;
        info!(database = %self.spec.database, table = %self.spec.table, "run logged");
        Ok(())
    }
}
