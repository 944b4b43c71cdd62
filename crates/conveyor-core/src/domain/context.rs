//! Execution context carried end-to-end through a lineage.
//!
//! The context has one reserved field, `pipeline` (remaining stages, consumed
//! left to right), and an open map of extension keys that downstream stages
//! must see unchanged. Values are never mutated in place: advancing the
//! pipeline yields a new context.

use serde::{Deserialize, Deserializer, Serialize};

use super::stage::Operation;

pub const PIPELINE_KEY: &str = "pipeline";

/// Extension key naming the logical store to use instead of the collection.
pub const STORE_OVERRIDE_KEY: &str = "ftmstore";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default, deserialize_with = "one_or_many")]
    pipeline: Vec<Operation>,

    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskContext {
    pub fn new<I, O>(pipeline: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<Operation>,
    {
        Self {
            pipeline: pipeline.into_iter().map(Into::into).collect(),
            extra: serde_json::Map::new(),
        }
    }

    /// Remaining stages after the current one.
    pub fn pipeline(&self) -> &[Operation] {
        &self.pipeline
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }

    pub fn extra(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.extra
    }

    /// Returns a copy with an extension key set.
    ///
    /// `pipeline` is reserved; setting it here is ignored.
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let key = key.into();
        if key == PIPELINE_KEY {
            tracing::warn!("ignoring attempt to set reserved context key via with()");
            return self;
        }
        self.extra.insert(key, value);
        self
    }

    /// Logical store override, if the context names one.
    pub fn store_override(&self) -> Option<&str> {
        self.extra
            .get(STORE_OVERRIDE_KEY)
            .and_then(serde_json::Value::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Splits off the next stage.
    ///
    /// Returns the next operation and a new context whose pipeline is the
    /// remainder, or `None` once the pipeline is exhausted.
    pub fn next_hop(&self) -> Option<(Operation, TaskContext)> {
        let (next, rest) = self.pipeline.split_first()?;
        let context = TaskContext {
            pipeline: rest.to_vec(),
            extra: self.extra.clone(),
        };
        Some((next.clone(), context))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Operation),
    Many(Vec<Operation>),
}

/// `pipeline` may be missing, null, a single name or a list of names.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Operation>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(operation)) => vec![operation],
        Some(OneOrMany::Many(operations)) => operations,
    })
}
