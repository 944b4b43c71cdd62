//! Error types and their operational classification.

use std::time::Duration;
use thiserror::Error;

use super::entity::EntityId;
use super::ids::TaskId;
use super::stage::Stage;

/// Operational classification of a failure.
///
/// - Transient: may succeed if tried again.
/// - Permanent: will fail the same way every time.
/// - Infrastructure: a broker or store outage; retrying later is reasonable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("no queue bound to routing key '{0}'")]
    Unroutable(String),

    #[error("broker rejected message for '{0}'")]
    Nacked(String),

    #[error("queue '{0}' is not declared")]
    UnknownQueue(String),

    #[error("queue '{queue}' already declared with max priority {declared}")]
    QueueMismatch { queue: String, declared: u8 },

    #[error("broker connection is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode task {task_id}: {source}")]
    Encode {
        task_id: TaskId,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("no publisher confirm within {0:?}")]
    ConfirmTimeout(Duration),
}

impl PublishError {
    pub fn is_unroutable(&self) -> bool {
        matches!(self, PublishError::Broker(BrokerError::Unroutable(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("bookkeeping store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("dataset '{dataset}' is unavailable: {reason}")]
    Unavailable { dataset: String, reason: String },

    #[error("entity store error: {0}")]
    Backend(String),
}

/// Failure inside a stage handler or one of its collaborators.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid {stage} payload: {source}")]
    Payload {
        stage: Stage,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("extraction failed for entity {entity_id}: {reason}")]
    Extraction { entity_id: EntityId, reason: String },

    #[error("analysis failed for entity {entity_id}: {reason}")]
    Analysis { entity_id: EntityId, reason: String },
}

impl HandlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Payload { .. } => ErrorKind::Permanent,
            HandlerError::Store(StoreError::Unavailable { .. }) => ErrorKind::Infrastructure,
            HandlerError::Store(StoreError::Backend(_)) => ErrorKind::Transient,
            HandlerError::Extraction { .. } | HandlerError::Analysis { .. } => {
                ErrorKind::Transient
            }
        }
    }
}

/// Why the router could not complete a task.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{stage} handler failed: {source}")]
    Handler {
        stage: Stage,
        #[source]
        source: HandlerError,
    },

    #[error("failed to publish continuation: {0}")]
    Continuation(#[source] PublishError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Handler { source, .. } => source.kind(),
            DispatchError::Continuation(_) => ErrorKind::Infrastructure,
        }
    }
}
