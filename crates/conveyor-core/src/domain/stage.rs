//! Stages and operations.
//!
//! A `Stage` is a named unit of pipeline work and maps 1:1 to a broker queue.
//! An `Operation` is what an envelope *says* it wants: either a known stage or
//! a name this worker does not handle. Keeping the unknown case as its own
//! variant lets the router match exhaustively instead of string-comparing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Recursive decomposition of a file entity.
    Ingest,
    /// Grouped analysis of the entities ingest produced.
    Analyze,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Ingest, Stage::Analyze];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Analyze => "analyze",
        }
    }

    /// Queue (and routing key) this stage consumes from.
    pub fn queue_name(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0:?}")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// Operation named by an envelope; doubles as the routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Stage(Stage),
    Unknown(String),
}

impl Operation {
    pub fn routing_key(&self) -> &str {
        match self {
            Operation::Stage(stage) => stage.queue_name(),
            Operation::Unknown(name) => name,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Operation::Stage(stage) => Some(*stage),
            Operation::Unknown(_) => None,
        }
    }
}

impl From<Stage> for Operation {
    fn from(stage: Stage) -> Self {
        Operation::Stage(stage)
    }
}

impl From<String> for Operation {
    fn from(name: String) -> Self {
        match name.parse::<Stage>() {
            Ok(stage) => Operation::Stage(stage),
            Err(_) => Operation::Unknown(name),
        }
    }
}

impl From<&str> for Operation {
    fn from(name: &str) -> Self {
        Operation::from(name.to_string())
    }
}

impl From<Operation> for String {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Stage(stage) => stage.as_str().to_string(),
            Operation::Unknown(name) => name,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::ingest("ingest", Operation::Stage(Stage::Ingest))]
    #[case::analyze("analyze", Operation::Stage(Stage::Analyze))]
    #[case::index("index", Operation::Unknown("index".to_string()))]
    #[case::case_sensitive("Ingest", Operation::Unknown("Ingest".to_string()))]
    fn operation_from_name(#[case] name: &str, #[case] expected: Operation) {
        assert_eq!(Operation::from(name), expected);
        assert_eq!(Operation::from(name).routing_key(), name);
    }

    #[test]
    fn operation_serializes_as_plain_string() {
        let json = serde_json::to_string(&Operation::from(Stage::Analyze)).unwrap();
        assert_eq!(json, "\"analyze\"");

        let unknown: Operation = serde_json::from_str("\"translate\"").unwrap();
        assert_eq!(unknown, Operation::Unknown("translate".to_string()));
        assert_eq!(unknown.stage(), None);
    }

    #[test]
    fn stage_parse_rejects_unknown() {
        assert_eq!("ingest".parse::<Stage>(), Ok(Stage::Ingest));
        assert_eq!(
            "ocr".parse::<Stage>(),
            Err(UnknownStage("ocr".to_string()))
        );
    }
}
