//! Test doubles and a wired-up in-memory app.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::builder::{App, AppBuilder};
use super::worker::Settlement;
use crate::config::WorkerConfig;
use crate::domain::{
    CollectionId, Entity, EntityId, EntitySet, HandlerError, JobId, Operation, Payload, Stage,
    StoreError, TaskContext, TaskEnvelope, TaskId,
};
use crate::impls::{InMemoryBroker, InMemoryLedger, InMemoryStoreResolver, StoringExtractor};
use crate::ports::{
    Analysis, AnalyzerFactory, Broker, EntityStore, Extractor, FixedPriority,
};

/// Stores like `StoringExtractor`, counts calls, and can be told to fail or
/// to hold each call for a while.
#[derive(Default)]
pub(crate) struct RecordingExtractor {
    calls: AtomicUsize,
    failures_left: AtomicU32,
    delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingExtractor {
    pub fn fail_next(&self, times: u32) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn hold_each_call(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Most calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for RecordingExtractor {
    async fn ingest_entity(
        &self,
        store: Arc<dyn EntityStore>,
        entity: Entity,
        context: &TaskContext,
    ) -> Result<EntitySet, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(HandlerError::Extraction {
                entity_id: entity.id,
                reason: "induced failure".to_string(),
            });
        }
        StoringExtractor.ingest_entity(store, entity, context).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FlushRecord {
    pub entity_id: EntityId,
    /// The `n` property of each fed fragment, `Null` when absent.
    pub fed: Vec<Value>,
}

/// Records every analysis; each flush discovers `<id>-found`.
#[derive(Default)]
pub(crate) struct RecordingAnalyzer {
    opened: AtomicUsize,
    flushes: Arc<Mutex<Vec<FlushRecord>>>,
}

impl RecordingAnalyzer {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> Vec<FlushRecord> {
        self.flushes.lock().unwrap().clone()
    }
}

impl AnalyzerFactory for RecordingAnalyzer {
    fn open(
        &self,
        _store: Arc<dyn EntityStore>,
        first: &Entity,
        _context: &TaskContext,
    ) -> Box<dyn Analysis> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(RecordingAnalysis {
            record: FlushRecord {
                entity_id: first.id.clone(),
                fed: Vec::new(),
            },
            log: Arc::clone(&self.flushes),
        })
    }
}

struct RecordingAnalysis {
    record: FlushRecord,
    log: Arc<Mutex<Vec<FlushRecord>>>,
}

#[async_trait]
impl Analysis for RecordingAnalysis {
    fn entity_id(&self) -> &EntityId {
        &self.record.entity_id
    }

    fn feed(&mut self, fragment: &Entity) {
        assert_eq!(fragment.id, self.record.entity_id, "fed a foreign fragment");
        self.record
            .fed
            .push(fragment.property("n").cloned().unwrap_or(Value::Null));
    }

    async fn flush(self: Box<Self>) -> Result<EntitySet, HandlerError> {
        let found = EntityId::new(format!("{}-found", self.record.entity_id));
        self.log.lock().unwrap().push(self.record);
        Ok(EntitySet::from([found]))
    }
}

/// Read-only store that returns its fragments in a fixed order.
pub(crate) struct ScriptedStore {
    fragments: Vec<Entity>,
}

impl ScriptedStore {
    pub fn new(fragments: Vec<Entity>) -> Self {
        Self { fragments }
    }
}

#[async_trait]
impl EntityStore for ScriptedStore {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn put(&self, _entity: Entity) -> Result<(), StoreError> {
        Err(StoreError::Backend("scripted store is read-only".to_string()))
    }

    async fn partials(&self, ids: &EntitySet) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .fragments
            .iter()
            .filter(|fragment| ids.contains(&fragment.id))
            .cloned()
            .collect())
    }
}

/// An `App` over in-memory collaborators, with handles to all of them.
pub(crate) struct Harness {
    pub broker: Arc<InMemoryBroker>,
    pub ledger: Arc<InMemoryLedger>,
    pub resolver: Arc<InMemoryStoreResolver>,
    pub extractor: Arc<RecordingExtractor>,
    pub analyzer: Arc<RecordingAnalyzer>,
    pub app: App,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(WorkerConfig::default()).await
    }

    pub async fn with_config(config: WorkerConfig) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let resolver = Arc::new(InMemoryStoreResolver::new());
        let extractor = Arc::new(RecordingExtractor::default());
        let analyzer = Arc::new(RecordingAnalyzer::default());

        let app = AppBuilder::new(config)
            .broker(broker.clone())
            .ledger(ledger.clone())
            .store_resolver(resolver.clone())
            .extractor(extractor.clone())
            .analyzer(analyzer.clone())
            .priority_picker(Arc::new(FixedPriority(5)))
            .build()
            .unwrap();
        app.declare_queues().await.unwrap();

        Self {
            broker,
            ledger,
            resolver,
            extractor,
            analyzer,
            app,
        }
    }

    /// Publishes a task for collection `c1`.
    pub async fn publish(&self, stage: Stage, context: TaskContext, payload: Payload) -> TaskId {
        self.app
            .publisher()
            .publish(
                &CollectionId::new("c1"),
                Operation::from(stage),
                Some(&JobId::new("job-1")),
                context,
                payload,
            )
            .await
            .unwrap()
    }

    /// Tasks waiting on a stage queue, in delivery order.
    pub fn pending(&self, stage: Stage) -> Vec<TaskEnvelope> {
        self.broker
            .pending_bodies(stage.queue_name())
            .iter()
            .map(|body| TaskEnvelope::from_bytes(body).unwrap())
            .collect()
    }

    /// Takes the next delivery from a stage queue and lets the worker settle it.
    pub async fn run_one(&self, stage: Stage) -> Settlement {
        let mut consumer = self.broker.consume(stage.queue_name(), 1).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(3600), consumer.next())
            .await
            .expect("no delivery arrived")
            .expect("broker closed");
        self.app.worker().process(delivery).await
    }
}
