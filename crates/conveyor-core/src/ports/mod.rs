//! Ports: the traits through which the engine reaches the outside world.
//!
//! The broker, the bookkeeping ledger, the entity store and the stage
//! collaborators are all reached through these traits; `impls` holds the
//! in-memory implementations.

pub mod broker;
pub mod clock;
pub mod collaborators;
pub mod id_generator;
pub mod ledger;
pub mod priority;
pub mod store;

pub use self::broker::{Broker, Consumer, Delivery, OutboundMessage};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::collaborators::{Analysis, AnalyzerFactory, Extractor};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::ledger::{DatasetStatus, TaskLedger, TaskRecord, TaskStatus};
pub use self::priority::{FixedPriority, PriorityPicker, UniformPriority};
pub use self::store::{EntityStore, StoreResolver};
