//! In-memory implementations of the ports.

pub mod collaborators;
pub mod memory_broker;
pub mod memory_ledger;
pub mod memory_store;

pub use self::collaborators::{MentionAnalyzer, StoringExtractor};
pub use self::memory_broker::{DeadLetter, InMemoryBroker, QueueStats};
pub use self::memory_ledger::InMemoryLedger;
pub use self::memory_store::{InMemoryEntityStore, InMemoryStoreResolver};
