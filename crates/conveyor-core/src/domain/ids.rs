//! Domain identifiers (strongly-typed IDs).
//!
//! ## ULID + Phantom type
//! - 生成する ID は ULID を `Id<T>` で包む（`TaskId` と `MessageId` は混同できない）
//! - wire 上は 26 文字の ULID 文字列そのまま
//!
//! ## 外部から来る ID
//! collection / job の ID は不透明な文字列 newtype。生成はせず、運ぶだけ。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for generated id kinds.
///
/// Provides the prefix used by `Display` ("task-", "msg-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Accepts both the bare ULID and the prefixed display form.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

/// Task marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Broker message marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Identifier of one published task envelope.
pub type TaskId = Id<Task>;

/// Identifier the broker assigns to a stored message.
pub type MessageId = Id<Message>;

/// Dataset name used when a task carries no collection.
pub const NO_COLLECTION: &str = "null";

/// Logical dataset a task belongs to.
///
/// An empty collection id is normalised to [`NO_COLLECTION`] so every task
/// lands under some dataset in the bookkeeping store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Self(NO_COLLECTION.to_string())
        } else {
            Self(value)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CollectionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for CollectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<CollectionId> for String {
    fn from(id: CollectionId) -> Self {
        id.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Groups the pipelines triggered by one user action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_prefix() {
        let ulid = Ulid::new();
        let task = TaskId::from_ulid(ulid);
        let message = MessageId::from_ulid(ulid);

        assert_eq!(task.as_ulid(), ulid);
        assert!(task.to_string().starts_with("task-"));
        assert!(message.to_string().starts_with("msg-"));
        // let _: TaskId = message; // <- does not compile
    }

    #[test]
    fn task_id_serializes_as_bare_ulid() {
        let ulid = Ulid::new();
        let task = TaskId::from_ulid(ulid);

        let json = serde_json::to_value(task).unwrap();
        assert_eq!(json, serde_json::Value::String(ulid.to_string()));

        let back: TaskId = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn task_id_parses_both_forms() {
        let task = TaskId::from_ulid(Ulid::new());
        let bare: TaskId = task.as_ulid().to_string().parse().unwrap();
        let prefixed: TaskId = task.to_string().parse().unwrap();
        assert_eq!(bare, task);
        assert_eq!(prefixed, task);
        assert!("task-not-a-ulid".parse::<TaskId>().is_err());
    }

    #[test]
    fn empty_collection_becomes_null_dataset() {
        assert_eq!(CollectionId::new("").as_str(), NO_COLLECTION);
        assert_eq!(CollectionId::new("  ").as_str(), NO_COLLECTION);
        assert_eq!(CollectionId::new("c1").as_str(), "c1");

        let parsed: CollectionId = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed.as_str(), NO_COLLECTION);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
        assert_eq!(size_of::<MessageId>(), 16);
    }
}
