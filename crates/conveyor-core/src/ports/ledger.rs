//! TaskLedger port - per-dataset bookkeeping of outstanding tasks.
//!
//! The ledger is advisory. It lets operators ask whether a dataset still has
//! work in flight; nothing in the dispatch path depends on it being accurate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{LedgerError, Operation, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub stage: Operation,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-dataset counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatasetStatus {
    pub pending: u64,
    pub running: u64,
    pub finished: u64,
    pub failed: u64,
}

impl DatasetStatus {
    pub fn is_active(&self) -> bool {
        self.pending + self.running > 0
    }
}

#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// Records a freshly published task as pending.
    async fn add_task(
        &self,
        dataset: &str,
        task_id: TaskId,
        stage: &Operation,
    ) -> Result<(), LedgerError>;

    /// Marks a task as picked up by a worker.
    ///
    /// Unknown tasks are recorded as running; a redelivered message may come
    /// from a ledger that lost its state.
    async fn checkout_task(
        &self,
        dataset: &str,
        task_id: TaskId,
        stage: &Operation,
    ) -> Result<(), LedgerError>;

    /// Removes the record and counts it as finished.
    async fn mark_done(&self, dataset: &str, task_id: TaskId) -> Result<(), LedgerError>;

    /// Removes the record and counts it as failed.
    async fn mark_failed(&self, dataset: &str, task_id: TaskId) -> Result<(), LedgerError>;

    async fn tasks(&self, dataset: &str) -> Result<Vec<TaskRecord>, LedgerError>;

    async fn status(&self, dataset: &str) -> Result<DatasetStatus, LedgerError>;

    async fn is_processing(&self, dataset: &str) -> Result<bool, LedgerError> {
        Ok(self.status(dataset).await?.is_active())
    }

    /// Datasets with pending or running tasks, sorted by name.
    async fn active_datasets(&self) -> Result<Vec<String>, LedgerError>;
}
