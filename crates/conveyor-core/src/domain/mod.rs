//! Domain model: identifiers, stages, the task envelope and its context,
//! entity references, payloads and errors.

pub mod context;
pub mod entity;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod payload;
pub mod stage;

pub use context::TaskContext;
pub use entity::{Entity, EntityId, EntitySet};
pub use envelope::{InvalidPriority, Priority, TaskEnvelope};
pub use errors::{
    BrokerError, DispatchError, ErrorKind, HandlerError, LedgerError, PublishError, StoreError,
};
pub use ids::{CollectionId, JobId, MessageId, TaskId};
pub use payload::{EntityIdsPayload, IngestPayload, Payload};
pub use stage::{Operation, Stage, UnknownStage};
