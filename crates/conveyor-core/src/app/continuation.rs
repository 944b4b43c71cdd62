//! Pipeline continuation: publishes the next stage of a finished task.

use std::sync::Arc;

use super::publisher::Publisher;
use crate::domain::{Payload, PublishError, TaskEnvelope, TaskId};

pub struct PipelineContinuation {
    publisher: Arc<Publisher>,
}

impl PipelineContinuation {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }

    /// Publishes `output` to the first remaining stage of `task`'s pipeline.
    ///
    /// The new task keeps the collection, job and context extension keys of
    /// `task`; its pipeline is the remainder. Returns `Ok(None)` when the
    /// pipeline is exhausted.
    pub async fn continue_pipeline(
        &self,
        task: &TaskEnvelope,
        output: Payload,
    ) -> Result<Option<TaskId>, PublishError> {
        let Some((next, context)) = task.context().next_hop() else {
            tracing::debug!(task_id = %task.task_id(), "pipeline complete");
            return Ok(None);
        };

        let task_id = self
            .publisher
            .publish(task.collection_id(), next, task.job_id(), context, output)
            .await?;
        Ok(Some(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CollectionId, JobId, Operation, Priority, TaskContext};
    use crate::impls::{InMemoryBroker, InMemoryLedger};
    use crate::ports::Broker;
    use serde_json::json;
    use ulid::Ulid;

    async fn setup(queues: &[&str]) -> (Arc<InMemoryBroker>, PipelineContinuation) {
        let broker = Arc::new(InMemoryBroker::new());
        for queue in queues {
            broker.declare_queue(queue, 10).await.unwrap();
        }
        let publisher = Publisher::new(broker.clone(), Arc::new(InMemoryLedger::new()));
        (broker, PipelineContinuation::new(Arc::new(publisher)))
    }

    fn task(context: TaskContext) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            CollectionId::new("c1"),
            Operation::from("start"),
            Priority::new(1, 10).unwrap(),
        )
        .with_job(Some(JobId::new("j1")))
        .with_context(context)
    }

    fn output(ids: &[&str]) -> Payload {
        let mut payload = Payload::new();
        payload.insert("entity_ids".to_string(), json!(ids));
        payload
    }

    fn only(broker: &InMemoryBroker, queue: &str) -> TaskEnvelope {
        let bodies = broker.pending_bodies(queue);
        assert_eq!(bodies.len(), 1, "expected exactly one task on '{queue}'");
        TaskEnvelope::from_bytes(&bodies[0]).unwrap()
    }

    #[tokio::test]
    async fn two_stage_pipeline_publishes_exactly_two_hops() {
        let (broker, continuation) = setup(&["a", "b"]).await;
        let source = task(TaskContext::new(["a", "b"]).with("lang", json!("en")));

        let first_id = continuation
            .continue_pipeline(&source, output(&["e1"]))
            .await
            .unwrap()
            .unwrap();
        let first = only(&broker, "a");
        assert_eq!(first.task_id(), first_id);
        assert_eq!(first.operation(), &Operation::from("a"));
        assert_eq!(first.context().pipeline(), &[Operation::from("b")]);
        assert_eq!(first.context().get("lang"), Some(&json!("en")));
        assert_eq!(first.collection_id(), source.collection_id());
        assert_eq!(first.job_id(), source.job_id());
        assert_eq!(first.payload(), &output(&["e1"]));
        assert_eq!(source.context().pipeline().len(), 2);

        continuation
            .continue_pipeline(&first, output(&["e1", "e2"]))
            .await
            .unwrap()
            .unwrap();
        let second = only(&broker, "b");
        assert_eq!(second.operation(), &Operation::from("b"));
        assert!(second.context().pipeline().is_empty());
        assert_eq!(second.context().get("lang"), Some(&json!("en")));

        let third = continuation
            .continue_pipeline(&second, output(&["e1"]))
            .await
            .unwrap();
        assert!(third.is_none());
        assert_eq!(broker.pending_bodies("a").len(), 1);
        assert_eq!(broker.pending_bodies("b").len(), 1);
    }

    #[tokio::test]
    async fn empty_pipeline_publishes_nothing() {
        let (broker, continuation) = setup(&["a"]).await;
        let result = continuation
            .continue_pipeline(&task(TaskContext::default()), output(&["e1"]))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(broker.pending_bodies("a").is_empty());
    }

    #[tokio::test]
    async fn unroutable_next_stage_is_an_error() {
        let (_broker, continuation) = setup(&[]).await;
        let err = continuation
            .continue_pipeline(&task(TaskContext::new(["ocr"])), output(&[]))
            .await
            .unwrap_err();
        assert!(err.is_unroutable());
    }
}
