//! Seed file: one ingest task per JSON line.
//!
//! ```text
//! {"collection_id": "c1", "job_id": "j1", "entity": {"id": "doc", "schema": "Document"}, "pipeline": ["analyze"]}
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;

use conveyor_core::app::Publisher;
use conveyor_core::domain::{
    CollectionId, Entity, IngestPayload, JobId, Operation, Stage, TaskContext, TaskId,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SeedTask {
    #[serde(default)]
    pub collection_id: String,
    #[serde(default)]
    pub job_id: Option<String>,
    pub entity: Entity,
    #[serde(default)]
    pub pipeline: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl SeedTask {
    /// Context for the ingest task: the extra keys plus the pipeline.
    pub fn task_context(&self) -> Result<TaskContext> {
        let mut map = self.context.clone();
        if !self.pipeline.is_null() {
            map.insert("pipeline".to_string(), self.pipeline.clone());
        }
        serde_json::from_value(serde_json::Value::Object(map)).context("invalid seed context")
    }
}

/// Parses every non-blank line; the first bad line fails the whole file.
pub fn parse(text: &str) -> Result<Vec<SeedTask>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| format!("seed line {}", index + 1))
        })
        .collect()
}

pub async fn publish_all(publisher: &Publisher, tasks: Vec<SeedTask>) -> Result<Vec<TaskId>> {
    let mut published = Vec::with_capacity(tasks.len());
    for task in tasks {
        let context = task.task_context()?;
        let job_id = task.job_id.map(JobId::new);
        let payload = IngestPayload {
            entity: task.entity,
        }
        .into_payload()
        .context("encoding seed entity")?;
        let task_id = publisher
            .publish(
                &CollectionId::new(task.collection_id),
                Operation::from(Stage::Ingest),
                job_id.as_ref(),
                context,
                payload,
            )
            .await?;
        published.push(task_id);
    }
    Ok(published)
}
