use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use schema::{FailedRow, InsertOutcome, RowRecord};
use tracing::debug;

use crate::{TableRef, WarehouseClient, WarehouseError};

/// Process-local warehouse. Tables are append-only row lists keyed by
/// qualified name; executed statements are kept in order.
#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<RowRecord>>,
    statements: Vec<String>,
    insert_calls: usize,
    query_calls: usize,
    queued_rejections: VecDeque<Vec<FailedRow>>,
    insert_fault: Option<String>,
    query_fault: Option<String>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next insert rejects the whole batch with these per-row errors.
    pub fn reject_next_insert(&self, failed_rows: Vec<FailedRow>) {
        self.lock().queued_rejections.push_back(failed_rows);
    }

    /// Every insert fails before producing an outcome.
    pub fn fail_inserts(&self, message: impl Into<String>) {
        self.lock().insert_fault = Some(message.into());
    }

    /// Every statement fails.
    pub fn fail_queries(&self, message: impl Into<String>) {
        self.lock().query_fault = Some(message.into());
    }

    pub fn rows(&self, table: &TableRef) -> Vec<RowRecord> {
        self.lock()
            .tables
            .get(&table.qualified_name())
            .cloned()
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn insert_calls(&self) -> usize {
        self.lock().insert_calls
    }

    pub fn query_calls(&self) -> usize {
        self.lock().query_calls
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WarehouseClient for InMemoryWarehouse {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[RowRecord],
    ) -> Result<InsertOutcome, WarehouseError> {
        let mut state = self.lock();
        state.insert_calls += 1;
        if let Some(message) = state.insert_fault.clone() {
            return Err(WarehouseError::Connection(message));
        }
        if let Some(failed_rows) = state.queued_rejections.pop_front() {
            return Ok(InsertOutcome::with_failures(failed_rows));
        }
        state
            .tables
            .entry(table.qualified_name())
            .or_default()
            .extend_from_slice(rows);
        debug!(table = %table.qualified_name(), rows = rows.len(), "rows stored in memory");
        Ok(InsertOutcome::success())
    }

    async fn execute_query(&self, _project_id: &str, sql: &str) -> Result<(), WarehouseError> {
        let mut state = self.lock();
        state.query_calls += 1;
        if let Some(message) = state.query_fault.clone() {
            return Err(WarehouseError::Service {
                status: 400,
                message,
            });
        }
        state.statements.push(sql.to_string());
        Ok(())
    }
}
