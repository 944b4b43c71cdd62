use std::sync::Arc;

use crate::domain::{EntityIdsPayload, EntitySet, HandlerError, Stage, TaskEnvelope};
use crate::ports::{Analysis, AnalyzerFactory, EntityStore};

/// Runs one analysis per entity over all of that entity's stored fragments.
pub struct AnalyzeHandler {
    factory: Arc<dyn AnalyzerFactory>,
}

impl AnalyzeHandler {
    pub fn new(factory: Arc<dyn AnalyzerFactory>) -> Self {
        Self { factory }
    }

    /// Returns the input ids plus every id the analyses discovered.
    ///
    /// Fragments are stable-sorted by id first, so each id gets exactly one
    /// accumulator and its fragments are fed in store order.
    pub async fn handle(
        &self,
        store: Arc<dyn EntityStore>,
        task: &TaskEnvelope,
    ) -> Result<EntitySet, HandlerError> {
        let payload: EntityIdsPayload =
            task.decode_payload().map_err(|source| HandlerError::Payload {
                stage: Stage::Analyze,
                source,
            })?;
        let mut output: EntitySet = payload.entity_ids.into_iter().collect();
        if output.is_empty() {
            return Ok(output);
        }

        let mut fragments = store.partials(&output).await?;
        fragments.sort_by(|a, b| a.id.cmp(&b.id));

        let mut open: Option<Box<dyn Analysis>> = None;
        for fragment in &fragments {
            if open
                .as_ref()
                .is_some_and(|analysis| analysis.entity_id() != &fragment.id)
                && let Some(done) = open.take()
            {
                output.extend(done.flush().await?);
            }
            open.get_or_insert_with(|| {
                self.factory
                    .open(Arc::clone(&store), fragment, task.context())
            })
            .feed(fragment);
        }
        if let Some(done) = open {
            output.extend(done.flush().await?);
        }

        tracing::debug!(
            fragments = fragments.len(),
            entities = output.len(),
            "analysis complete"
        );
        Ok(output)
    }
}
