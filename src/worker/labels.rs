//! Labels refresh: collection-scoped, batched.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{RefreshOutcome, RefreshWorker, WorkerDeps};
use crate::engine::context::ExecutionContext;
use crate::error::Result;
use crate::model::record::RecordWrite;
use crate::model::work::WorkItem;
use crate::upstream::SparqlResults;
use crate::upstream::sparql::{self, is_item_id};

/// Ids per upstream query.
pub const LABEL_BATCH: usize = 250;

pub struct LabelsWorker {
    deps: WorkerDeps,
}

impl LabelsWorker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl RefreshWorker for LabelsWorker {
    fn operation(&self) -> &'static str {
        "labels"
    }

    async fn refresh(&self, item: &WorkItem, ctx: &ExecutionContext) -> Result<RefreshOutcome> {
        let ids = match &item.record_id {
            Some(id) => vec![id.clone()],
            None => {
                self.deps
                    .store
                    .ids_queued_at(item.kind, &item.operation, item.queued_at)
                    .await?
            }
        };
        let (ids, invalid): (Vec<String>, Vec<String>) =
            ids.into_iter().partition(|id| is_item_id(id));
        if !invalid.is_empty() {
            warn!(kind = %item.kind, ?invalid, "skipping ids that are not Wikidata items");
        }

        let handler = ctx.rate_limit_handler();
        let mut outcome = RefreshOutcome::default();

        for batch in ids.chunks(LABEL_BATCH) {
            let results: SparqlResults = self
                .deps
                .client
                .query(&sparql::labels(batch)?, handler.as_ref())
                .await?;

            let mut labels: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
            for row in &results.results.bindings {
                let id = row.item_id("id")?;
                let label = row.require("label")?;
                if let Some(lang) = &label.lang {
                    labels
                        .entry(id)
                        .or_default()
                        .insert(lang.clone(), label.value.clone());
                }
            }

            // Each record is fenced on its own: a superseded sibling does not
            // hold back the rest of the batch.
            for (id, labels) in labels {
                let write = RecordWrite::SetLabels {
                    kind: item.kind,
                    id: id.clone(),
                    labels,
                };
                let applied = self.deps.write_fenced(item, &id, vec![write]).await?;
                outcome.count(applied);
            }
        }

        info!(
            kind = %item.kind,
            records = ids.len(),
            written = outcome.written,
            stale = outcome.stale,
            "labels refreshed"
        );
        Ok(outcome)
    }
}
