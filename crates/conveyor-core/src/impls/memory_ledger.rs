//! In-memory task ledger keyed by dataset name.
//!
//! A task may finish before its publisher gets to record it. Finished ids are
//! remembered per dataset so such a late `add_task` does not leave a stale
//! pending record behind. These tombstones expire after a TTL and are capped
//! per dataset, so a long-running worker does not accumulate them.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::domain::{LedgerError, Operation, TaskId};
use crate::ports::{Clock, DatasetStatus, SystemClock, TaskLedger, TaskRecord, TaskStatus};

/// How long a finished id is remembered.
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(600);

/// Most finished ids remembered per dataset.
pub const DEFAULT_TOMBSTONE_LIMIT: usize = 10_000;

#[derive(Debug, Default)]
struct DatasetEntry {
    tasks: BTreeMap<TaskId, TaskRecord>,
    closed: HashSet<TaskId>,
    // Oldest first.
    closed_order: VecDeque<(DateTime<Utc>, TaskId)>,
    finished: u64,
    failed: u64,
}

impl DatasetEntry {
    fn close(&mut self, task_id: TaskId, now: DateTime<Utc>, ttl: Duration, limit: usize) {
        if self.closed.insert(task_id) {
            self.closed_order.push_back((now, task_id));
        }
        while let Some(&(closed_at, oldest)) = self.closed_order.front() {
            let expired = (now - closed_at).to_std().is_ok_and(|age| age >= ttl);
            if !expired && self.closed_order.len() <= limit {
                break;
            }
            self.closed_order.pop_front();
            self.closed.remove(&oldest);
        }
    }

    fn status(&self) -> DatasetStatus {
        let mut status = DatasetStatus {
            finished: self.finished,
            failed: self.failed,
            ..DatasetStatus::default()
        };
        for record in self.tasks.values() {
            match record.status {
                TaskStatus::Pending => status.pending += 1,
                TaskStatus::Running => status.running += 1,
            }
        }
        status
    }
}

pub struct InMemoryLedger {
    datasets: DashMap<String, DatasetEntry>,
    clock: Arc<dyn Clock>,
    tombstone_ttl: Duration,
    tombstone_limit: usize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            datasets: DashMap::new(),
            clock,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            tombstone_limit: DEFAULT_TOMBSTONE_LIMIT,
        }
    }

    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    pub fn with_tombstone_limit(mut self, limit: usize) -> Self {
        self.tombstone_limit = limit;
        self
    }

    /// Finished ids currently remembered for `dataset`.
    pub fn tombstones(&self, dataset: &str) -> usize {
        self.datasets
            .get(dataset)
            .map_or(0, |entry| entry.closed.len())
    }

    fn upsert(&self, dataset: &str, task_id: TaskId, stage: &Operation, status: TaskStatus) {
        let now = self.clock.now();
        let mut entry = self.datasets.entry(dataset.to_string()).or_default();
        if entry.closed.contains(&task_id) {
            tracing::debug!(dataset, %task_id, "ignoring update for a finished task");
            return;
        }
        entry
            .tasks
            .entry(task_id)
            .and_modify(|record| {
                record.status = status;
                record.updated_at = now;
            })
            .or_insert_with(|| TaskRecord {
                task_id,
                stage: stage.clone(),
                status,
                created_at: now,
                updated_at: now,
            });
    }

    fn finish(&self, dataset: &str, task_id: TaskId, failed: bool) {
        let now = self.clock.now();
        let mut entry = self.datasets.entry(dataset.to_string()).or_default();
        if entry.tasks.remove(&task_id).is_none() {
            tracing::debug!(dataset, %task_id, "finishing a task the ledger never saw");
        }
        entry.close(task_id, now, self.tombstone_ttl, self.tombstone_limit);
        if failed {
            entry.failed += 1;
        } else {
            entry.finished += 1;
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskLedger for InMemoryLedger {
    async fn add_task(
        &self,
        dataset: &str,
        task_id: TaskId,
        stage: &Operation,
    ) -> Result<(), LedgerError> {
        self.upsert(dataset, task_id, stage, TaskStatus::Pending);
        Ok(())
    }

    async fn checkout_task(
        &self,
        dataset: &str,
        task_id: TaskId,
        stage: &Operation,
    ) -> Result<(), LedgerError> {
        self.upsert(dataset, task_id, stage, TaskStatus::Running);
        Ok(())
    }

    async fn mark_done(&self, dataset: &str, task_id: TaskId) -> Result<(), LedgerError> {
        self.finish(dataset, task_id, false);
        Ok(())
    }

    async fn mark_failed(&self, dataset: &str, task_id: TaskId) -> Result<(), LedgerError> {
        self.finish(dataset, task_id, true);
        Ok(())
    }

    async fn tasks(&self, dataset: &str) -> Result<Vec<TaskRecord>, LedgerError> {
        Ok(self
            .datasets
            .get(dataset)
            .map(|entry| entry.tasks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn status(&self, dataset: &str) -> Result<DatasetStatus, LedgerError> {
        Ok(self
            .datasets
            .get(dataset)
            .map(|entry| entry.status())
            .unwrap_or_default())
    }

    async fn active_datasets(&self) -> Result<Vec<String>, LedgerError> {
        let mut names: Vec<String> = self
            .datasets
            .iter()
            .filter(|entry| entry.value().status().is_active())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Stage;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn task_id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn task_moves_from_pending_to_running_to_finished() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let ledger = InMemoryLedger::with_clock(Arc::new(FixedClock::new(at)));
        let id = task_id();
        let stage = Operation::from(Stage::Ingest);

        ledger.add_task("c1", id, &stage).await.unwrap();
        let records = ledger.tasks("c1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TaskStatus::Pending);
        assert_eq!(records[0].stage, stage);
        assert_eq!(records[0].created_at, at);
        assert!(ledger.is_processing("c1").await.unwrap());

        ledger.checkout_task("c1", id, &stage).await.unwrap();
        let status = ledger.status("c1").await.unwrap();
        assert_eq!((status.pending, status.running), (0, 1));

        ledger.mark_done("c1", id).await.unwrap();
        let status = ledger.status("c1").await.unwrap();
        assert_eq!(status, DatasetStatus { finished: 1, ..DatasetStatus::default() });
        assert!(!ledger.is_processing("c1").await.unwrap());
        assert!(ledger.tasks("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_tasks_are_counted_separately() {
        let ledger = InMemoryLedger::new();
        let id = task_id();
        ledger
            .add_task("c1", id, &Operation::from(Stage::Analyze))
            .await
            .unwrap();
        ledger.mark_failed("c1", id).await.unwrap();

        let status = ledger.status("c1").await.unwrap();
        assert_eq!((status.failed, status.finished), (1, 0));
    }

    #[tokio::test]
    async fn checkout_of_unknown_task_records_it_running() {
        let ledger = InMemoryLedger::new();
        ledger
            .checkout_task("c2", task_id(), &Operation::from(Stage::Ingest))
            .await
            .unwrap();
        assert_eq!(ledger.status("c2").await.unwrap().running, 1);
    }

    #[tokio::test]
    async fn late_record_of_a_finished_task_is_ignored() {
        let ledger = InMemoryLedger::new();
        let id = task_id();
        let stage = Operation::from(Stage::Analyze);
        ledger.checkout_task("c1", id, &stage).await.unwrap();
        ledger.mark_done("c1", id).await.unwrap();
        ledger.add_task("c1", id, &stage).await.unwrap();

        assert!(!ledger.is_processing("c1").await.unwrap());
        assert_eq!(ledger.status("c1").await.unwrap().finished, 1);
    }

    #[tokio::test]
    async fn active_datasets_lists_only_busy_ones_sorted() {
        let ledger = InMemoryLedger::new();
        let stage = Operation::from(Stage::Ingest);
        let done = task_id();
        ledger.add_task("zeta", task_id(), &stage).await.unwrap();
        ledger.add_task("alpha", task_id(), &stage).await.unwrap();
        ledger.add_task("idle", done, &stage).await.unwrap();
        ledger.mark_done("idle", done).await.unwrap();

        assert_eq!(
            ledger.active_datasets().await.unwrap(),
            vec!["alpha".to_string(), "zeta".to_string()]
        );
        assert_eq!(ledger.status("missing").await.unwrap(), DatasetStatus::default());
    }

    /// Clock that tests move forward by hand.
    struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn advance(&self, by: chrono::Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[tokio::test]
    async fn tombstones_stay_bounded_while_draining_many_tasks() {
        let ledger = InMemoryLedger::new().with_tombstone_limit(100);
        let stage = Operation::from(Stage::Ingest);

        for _ in 0..1_000 {
            let id = task_id();
            ledger.add_task("c1", id, &stage).await.unwrap();
            ledger.checkout_task("c1", id, &stage).await.unwrap();
            ledger.mark_done("c1", id).await.unwrap();
        }

        assert_eq!(ledger.tombstones("c1"), 100);
        assert_eq!(ledger.status("c1").await.unwrap().finished, 1_000);
        assert!(!ledger.is_processing("c1").await.unwrap());
    }

    #[tokio::test]
    async fn tombstones_expire_after_their_ttl() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let clock = Arc::new(ManualClock(std::sync::Mutex::new(start)));
        let ledger =
            InMemoryLedger::with_clock(clock.clone()).with_tombstone_ttl(Duration::from_secs(60));
        let stage = Operation::from(Stage::Analyze);

        let early: Vec<TaskId> = (0..5).map(|_| task_id()).collect();
        for id in &early {
            ledger.mark_done("c1", *id).await.unwrap();
        }
        assert_eq!(ledger.tombstones("c1"), 5);

        // A late record inside the TTL is still swallowed.
        ledger.add_task("c1", early[0], &stage).await.unwrap();
        assert!(!ledger.is_processing("c1").await.unwrap());

        clock.advance(chrono::Duration::seconds(61));
        ledger.mark_done("c1", task_id()).await.unwrap();

        assert_eq!(ledger.tombstones("c1"), 1);
        assert_eq!(ledger.status("c1").await.unwrap().finished, 6);
    }
}
