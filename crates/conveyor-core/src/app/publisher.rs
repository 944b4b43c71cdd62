//! Publisher - turns one unit of work into a confirmed broker message.
//!
//! Every publish gets a fresh task id and a random priority, is sent
//! persistent and mandatory, and waits for the broker confirm. Only a
//! confirmed task is recorded in the ledger.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{
    CollectionId, JobId, Operation, Payload, PublishError, TaskContext, TaskEnvelope, TaskId,
};
use crate::ports::{
    Broker, IdGenerator, OutboundMessage, PriorityPicker, SystemClock, TaskLedger,
    UlidGenerator, UniformPriority,
};

pub struct Publisher {
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn TaskLedger>,
    ids: Arc<dyn IdGenerator>,
    priorities: Arc<dyn PriorityPicker>,
    max_priority: u8,
    confirm_timeout: Duration,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, ledger: Arc<dyn TaskLedger>) -> Self {
        Self {
            broker,
            ledger,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            priorities: Arc::new(UniformPriority),
            max_priority: 10,
            confirm_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_priority_picker(mut self, priorities: Arc<dyn PriorityPicker>) -> Self {
        self.priorities = priorities;
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = max_priority;
        self
    }

    pub fn with_confirm_timeout(mut self, confirm_timeout: Duration) -> Self {
        self.confirm_timeout = confirm_timeout;
        self
    }

    pub fn max_priority(&self) -> u8 {
        self.max_priority
    }

    /// Publishes a task for `operation` and records it under the collection.
    ///
    /// Failures are logged here and returned; nothing is recorded for a task
    /// the broker did not confirm. A ledger failure after the confirm is only
    /// a warning.
    pub async fn publish(
        &self,
        collection_id: &CollectionId,
        operation: Operation,
        job_id: Option<&JobId>,
        context: TaskContext,
        payload: Payload,
    ) -> Result<TaskId, PublishError> {
        let task_id = self.ids.generate_task_id();
        let priority = self.priorities.pick(self.max_priority);
        let envelope = TaskEnvelope::new(task_id, collection_id.clone(), operation, priority)
            .with_job(job_id.cloned())
            .with_context(context)
            .with_payload(payload);

        if let Err(e) = self.send(&envelope).await {
            tracing::error!(
                collection = %collection_id,
                operation = %envelope.operation(),
                %task_id,
                error = %e,
                "failed to publish task"
            );
            return Err(e);
        }

        tracing::debug!(
            collection = %collection_id,
            operation = %envelope.operation(),
            %task_id,
            %priority,
            "published task"
        );

        if let Err(e) = self
            .ledger
            .add_task(collection_id.as_str(), task_id, envelope.operation())
            .await
        {
            tracing::warn!(
                collection = %collection_id,
                %task_id,
                error = %e,
                "published task could not be recorded"
            );
        }

        Ok(task_id)
    }

    async fn send(&self, envelope: &TaskEnvelope) -> Result<(), PublishError> {
        let body = envelope
            .to_bytes()
            .map_err(|source| PublishError::Encode {
                task_id: envelope.task_id(),
                source,
            })?;
        let message = OutboundMessage {
            routing_key: envelope.operation().routing_key().to_string(),
            body,
            priority: envelope.priority(),
            persistent: true,
            mandatory: true,
        };
        tokio::time::timeout(self.confirm_timeout, self.broker.publish(message))
            .await
            .map_err(|_| PublishError::ConfirmTimeout(self.confirm_timeout))??;
        Ok(())
    }
}
