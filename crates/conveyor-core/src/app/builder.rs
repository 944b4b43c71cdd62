//! AppBuilder - dispatch engine のワイヤリング
//!
//! # Fail-fast
//! - collaborator は `build()` 時にすべて検査する
//! - 足りなければ起動時に `BuildError`。最初のタスクで panic することはない

use std::sync::Arc;

use super::continuation::PipelineContinuation;
use super::decision::{Decider, DefaultDecider};
use super::handlers::{AnalyzeHandler, IngestHandler};
use super::publisher::Publisher;
use super::retry::RetryPolicy;
use super::router::StageRouter;
use super::status::{SystemInfo, WorkerMetrics};
use super::worker::{Worker, WorkerGroup};
use crate::config::{ConfigError, WorkerConfig};
use crate::domain::{BrokerError, Stage};
use crate::ports::{
    AnalyzerFactory, Broker, Clock, Extractor, IdGenerator, PriorityPicker, StoreResolver,
    SystemClock, TaskLedger,
};

/// # Example
/// ```ignore
/// let app = AppBuilder::new(config)
///     .broker(broker)
///     .ledger(ledger)
///     .store_resolver(resolver)
///     .extractor(extractor)
///     .analyzer(analyzer)
///     .build()?;
/// let workers = app.start().await?;
/// ```
pub struct AppBuilder {
    config: WorkerConfig,
    broker: Option<Arc<dyn Broker>>,
    ledger: Option<Arc<dyn TaskLedger>>,
    resolver: Option<Arc<dyn StoreResolver>>,
    extractor: Option<Arc<dyn Extractor>>,
    analyzer: Option<Arc<dyn AnalyzerFactory>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    priority_picker: Option<Arc<dyn PriorityPicker>>,
    decider: Option<Arc<dyn Decider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing collaborators: {0:?}. These must be provided before build().")]
    MissingCollaborators(Vec<&'static str>),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl AppBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            broker: None,
            ledger: None,
            resolver: None,
            extractor: None,
            analyzer: None,
            id_generator: None,
            priority_picker: None,
            decider: None,
        }
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn TaskLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn store_resolver(mut self, resolver: Arc<dyn StoreResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn AnalyzerFactory>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Defaults to ULIDs on the system clock.
    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    /// Defaults to uniform priorities.
    pub fn priority_picker(mut self, priority_picker: Arc<dyn PriorityPicker>) -> Self {
        self.priority_picker = Some(priority_picker);
        self
    }

    /// Defaults to `DefaultDecider` over the configured retry policy.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        let mut missing = Vec::new();
        if self.broker.is_none() {
            missing.push("broker");
        }
        if self.ledger.is_none() {
            missing.push("ledger");
        }
        if self.resolver.is_none() {
            missing.push("store_resolver");
        }
        if self.extractor.is_none() {
            missing.push("extractor");
        }
        if self.analyzer.is_none() {
            missing.push("analyzer");
        }
        let (Some(broker), Some(ledger), Some(resolver), Some(extractor), Some(analyzer)) = (
            self.broker,
            self.ledger,
            self.resolver,
            self.extractor,
            self.analyzer,
        ) else {
            return Err(BuildError::MissingCollaborators(missing));
        };

        let config = self.config;
        let retry_policy = RetryPolicy::from(&config.retry);

        let mut publisher = Publisher::new(Arc::clone(&broker), Arc::clone(&ledger))
            .with_max_priority(config.broker.max_priority)
            .with_confirm_timeout(config.confirm_timeout());
        if let Some(ids) = self.id_generator {
            publisher = publisher.with_id_generator(ids);
        }
        if let Some(priorities) = self.priority_picker {
            publisher = publisher.with_priority_picker(priorities);
        }
        let publisher = Arc::new(publisher);

        let info = Arc::new(SystemInfo::current(SystemClock.now()));
        let metrics = Arc::new(WorkerMetrics::default());
        let router = Arc::new(
            StageRouter::new(
                resolver,
                IngestHandler::new(extractor),
                AnalyzeHandler::new(analyzer),
                PipelineContinuation::new(Arc::clone(&publisher)),
                Arc::clone(&info),
                Arc::clone(&metrics),
            )
            .with_publish_failure_policy(config.worker.on_publish_failure),
        );
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(retry_policy.clone())));
        let worker = Arc::new(Worker::new(
            Arc::clone(&router),
            Arc::clone(&ledger),
            decider,
            Arc::clone(&metrics),
        ));

        Ok(App {
            config,
            broker,
            ledger,
            publisher,
            router,
            worker,
            metrics,
            info,
            retry_policy,
        })
    }
}

/// The wired engine.
pub struct App {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn TaskLedger>,
    publisher: Arc<Publisher>,
    router: Arc<StageRouter>,
    worker: Arc<Worker>,
    metrics: Arc<WorkerMetrics>,
    info: Arc<SystemInfo>,
    retry_policy: RetryPolicy,
}

impl App {
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn router(&self) -> &StageRouter {
        &self.router
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn ledger(&self) -> &Arc<dyn TaskLedger> {
        &self.ledger
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn info(&self) -> &SystemInfo {
        &self.info
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Declares a queue for every known stage, so continuations can be routed
    /// even to stages this process does not consume.
    pub async fn declare_queues(&self) -> Result<(), BrokerError> {
        for stage in Stage::ALL {
            self.broker
                .declare_queue(stage.queue_name(), self.config.broker.max_priority)
                .await?;
        }
        Ok(())
    }

    /// Logs the system info, declares queues and spawns the configured
    /// workers.
    pub async fn start(&self) -> Result<WorkerGroup, BrokerError> {
        self.info.log();
        self.declare_queues().await?;

        let plan: Vec<(Stage, u16)> = self
            .config
            .worker
            .stages
            .iter()
            .map(|&stage| (stage, self.config.prefetch_for(stage)))
            .collect();
        tracing::info!(
            stages = ?plan,
            threads = self.config.worker.threads,
            "starting workers"
        );
        WorkerGroup::spawn(
            Arc::clone(&self.broker),
            Arc::clone(&self.worker),
            &plan,
            self.config.worker.threads,
        )
        .await
    }
}
