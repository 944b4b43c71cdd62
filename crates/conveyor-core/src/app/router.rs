//! StageRouter - routes a decoded task to its stage handler and continues
//! the pipeline with the handler's output.
//!
//! The router does not retry. A failure is returned to the worker, which
//! settles the delivery.

use std::sync::Arc;

use super::continuation::PipelineContinuation;
use super::handlers::{AnalyzeHandler, IngestHandler};
use super::status::{SystemInfo, WorkerMetrics};
use crate::config::PublishFailurePolicy;
use crate::domain::{
    DispatchError, EntityIdsPayload, EntitySet, HandlerError, Operation, Stage, TaskEnvelope,
    TaskId,
};
use crate::ports::StoreResolver;

/// What happened to a task the router accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The handler ran. `continuation` is the next task, if one was published.
    Completed {
        entities: usize,
        continuation: Option<TaskId>,
    },
    /// No handler for this operation; nothing ran.
    Skipped,
}

pub struct StageRouter {
    resolver: Arc<dyn StoreResolver>,
    ingest: IngestHandler,
    analyze: AnalyzeHandler,
    continuation: PipelineContinuation,
    on_publish_failure: PublishFailurePolicy,
    info: Arc<SystemInfo>,
    metrics: Arc<WorkerMetrics>,
}

impl StageRouter {
    pub fn new(
        resolver: Arc<dyn StoreResolver>,
        ingest: IngestHandler,
        analyze: AnalyzeHandler,
        continuation: PipelineContinuation,
        info: Arc<SystemInfo>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            resolver,
            ingest,
            analyze,
            continuation,
            on_publish_failure: PublishFailurePolicy::default(),
            info,
            metrics,
        }
    }

    pub fn with_publish_failure_policy(mut self, policy: PublishFailurePolicy) -> Self {
        self.on_publish_failure = policy;
        self
    }

    pub async fn dispatch(&self, task: &TaskEnvelope) -> Result<DispatchOutcome, DispatchError> {
        let stage = match task.operation() {
            Operation::Stage(stage) => *stage,
            Operation::Unknown(name) => {
                tracing::warn!(
                    collection = %task.collection_id(),
                    operation = %name,
                    task_id = %task.task_id(),
                    "no handler for operation, skipping"
                );
                self.metrics.record_skipped();
                return Ok(DispatchOutcome::Skipped);
            }
        };

        tracing::info!(
            collection = %task.collection_id(),
            operation = %stage,
            task_id = %task.task_id(),
            priority = %task.priority(),
            version = self.info.version,
            "task started"
        );
        self.metrics.record_started();

        let output = match self.run_stage(stage, task).await {
            Ok(output) => output,
            Err(source) => {
                self.metrics.record_failed();
                return Err(DispatchError::Handler { stage, source });
            }
        };
        let entities = output.len();

        let continuation = match self
            .continuation
            .continue_pipeline(task, EntityIdsPayload::from(output).into_payload())
            .await
        {
            Ok(next) => {
                if next.is_some() {
                    self.metrics.record_continuation();
                }
                next
            }
            Err(e) => {
                self.metrics.record_continuation_failure();
                match self.on_publish_failure {
                    PublishFailurePolicy::Redeliver => {
                        self.metrics.record_failed();
                        return Err(DispatchError::Continuation(e));
                    }
                    PublishFailurePolicy::Drop => {
                        tracing::warn!(
                            task_id = %task.task_id(),
                            error = %e,
                            "continuation not published, pipeline ends here"
                        );
                        None
                    }
                }
            }
        };

        tracing::info!(
            collection = %task.collection_id(),
            operation = %stage,
            task_id = %task.task_id(),
            priority = %task.priority(),
            entities,
            "task done"
        );
        self.metrics.record_completed();
        Ok(DispatchOutcome::Completed {
            entities,
            continuation,
        })
    }

    async fn run_stage(&self, stage: Stage, task: &TaskEnvelope) -> Result<EntitySet, HandlerError> {
        let store = self.resolver.get_dataset(task.dataset_name(), stage).await?;
        match stage {
            Stage::Ingest => self.ingest.handle(store, task).await,
            Stage::Analyze => self.analyze.handle(store, task).await,
        }
    }
}
