//! Warehouse seam for scan ingestion.
//!
//! The ingestion service only needs two things from the warehouse: append a
//! batch of rows to a table, and run a DDL statement. [`WarehouseClient`]
//! captures exactly that; [`BigQueryClient`] talks to the BigQuery REST API
//! and [`InMemoryWarehouse`] keeps everything in process for tests and local
//! runs.

pub mod bigquery;
pub mod credentials;
pub mod memory;

pub use bigquery::{BigQueryClient, BigQueryConfig};
pub use credentials::{AccessTokenCache, TokenSource};
pub use memory::InMemoryWarehouse;

use async_trait::async_trait;
use schema::{InsertOutcome, RowRecord};
use thiserror::Error;

/// Failures that prevented a warehouse call from producing an outcome.
///
/// Rows rejected by an otherwise successful insert are not errors; they are
/// reported through [`InsertOutcome`].
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("failed to reach warehouse: {0}")]
    Connection(String),

    #[error("warehouse request timed out")]
    Timeout,

    #[error("warehouse authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited by warehouse")]
    RateLimited,

    #[error("warehouse returned status {status}: {message}")]
    Service { status: u16, message: String },

    #[error("credential error: {0}")]
    Credentials(String),

    #[error("unexpected warehouse response: {0}")]
    Serialization(String),
}

pub(crate) fn map_transport_error(error: reqwest::Error) -> WarehouseError {
    if error.is_timeout() {
        WarehouseError::Timeout
    } else {
        WarehouseError::Connection(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }

    /// Sibling object in the same dataset, e.g. a view.
    pub fn sibling(&self, table_id: impl Into<String>) -> Self {
        Self {
            project_id: self.project_id.clone(),
            dataset_id: self.dataset_id.clone(),
            table_id: table_id.into(),
        }
    }

    /// `project.dataset.table`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }

    pub fn sql_name(&self) -> String {
        format!("`{}`", self.qualified_name())
    }
}

#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Appends `rows` to `table` in a single call.
    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[RowRecord],
    ) -> Result<InsertOutcome, WarehouseError>;

    /// Runs a standard-SQL statement billed to `project_id`.
    async fn execute_query(&self, project_id: &str, sql: &str) -> Result<(), WarehouseError>;
}

/// Redefines `view_id` to hold only the rows of the most recent ingestion
/// batch of `table`.
pub fn latest_scan_view_sql(table: &TableRef, view_id: &str) -> String {
    let view = table.sibling(view_id);
    let source = table.sql_name();
    format!(
        "CREATE OR REPLACE VIEW {} AS SELECT * FROM {source} WHERE timestamp = (SELECT MAX(timestamp) FROM {source})",
        view.sql_name()
    )
}
