//! TaskEnvelope - the message placed on the broker.
//!
//! An envelope is immutable once built. Pipeline continuation never edits an
//! envelope; it publishes a new one.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use super::context::TaskContext;
use super::ids::{CollectionId, JobId, TaskId};
use super::payload::Payload;
use super::stage::Operation;

/// Message priority in `[1, max]`.
///
/// Chosen at random per publish so no dataset is systematically starved; it
/// is a scheduling hint, never an ordering guarantee.
///
/// On the wire it is a bare integer. The upper bound is the queue's declared
/// maximum and is enforced by the broker, so decoding only rejects 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("priority must be at least 1, got {0}")]
pub struct InvalidPriority(pub u8);

impl TryFrom<u8> for Priority {
    type Error = InvalidPriority;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value, u8::MAX).ok_or(InvalidPriority(value))
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl Priority {
    pub const MIN: u8 = 1;

    /// Returns `None` when `value` is outside `[1, max]`.
    pub fn new(value: u8, max: u8) -> Option<Self> {
        (Self::MIN..=max).contains(&value).then_some(Self(value))
    }

    /// Clamps `value` into `[1, max]`. A `max` of 0 is treated as 1.
    pub fn clamped(value: u8, max: u8) -> Self {
        Self(value.clamp(Self::MIN, max.max(Self::MIN)))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    collection_id: CollectionId,
    #[serde(default)]
    job_id: Option<JobId>,
    task_id: TaskId,
    operation: Operation,
    #[serde(default, deserialize_with = "null_as_default")]
    context: TaskContext,
    #[serde(default, deserialize_with = "null_as_default")]
    payload: Payload,
    priority: Priority,
}

impl TaskEnvelope {
    pub fn new(
        task_id: TaskId,
        collection_id: CollectionId,
        operation: Operation,
        priority: Priority,
    ) -> Self {
        Self {
            collection_id,
            job_id: None,
            task_id,
            operation,
            context: TaskContext::default(),
            payload: Payload::new(),
            priority,
        }
    }

    pub fn with_job(mut self, job_id: Option<JobId>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Logical store this task reads and writes: the context override, else
    /// the collection.
    pub fn dataset_name(&self) -> &str {
        self.context
            .store_override()
            .unwrap_or_else(|| self.collection_id.as_str())
    }

    /// Decodes the payload into a stage-specific shape.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
