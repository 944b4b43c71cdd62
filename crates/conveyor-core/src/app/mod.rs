//! App - the dispatch engine assembled from ports.
//!
//! # Components
//! - **Publisher**: confirmed, prioritised publishing of task envelopes
//! - **PipelineContinuation**: publishes the next stage of a finished task
//! - **StageRouter**: routes a task to its stage handler
//! - **Worker / WorkerGroup**: settles deliveries (ack, requeue, dead-letter)
//! - **AppBuilder**: wiring with startup validation

pub mod builder;
pub mod continuation;
pub mod decision;
pub mod handlers;
pub mod publisher;
pub mod retry;
pub mod router;
pub mod status;
pub mod worker;

#[cfg(test)]
pub(crate) mod fixtures;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::continuation::PipelineContinuation;
pub use self::decision::{Decider, Decision, DefaultDecider};
pub use self::publisher::Publisher;
pub use self::retry::RetryPolicy;
pub use self::router::{DispatchOutcome, StageRouter};
pub use self::status::{MetricsSnapshot, SystemInfo, WorkerMetrics};
pub use self::worker::{Settlement, Worker, WorkerGroup};
