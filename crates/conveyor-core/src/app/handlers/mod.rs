//! Stage handlers. Each turns one task into the set of entity ids it
//! produced.

pub mod analyze;
pub mod ingest;

pub use self::analyze::AnalyzeHandler;
pub use self::ingest::IngestHandler;
