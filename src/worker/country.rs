//! Wholesale re-sync of the country list.
//!
//! Not staleness driven: the list is small and replaced as a whole, so it
//! runs on its own schedule and writes without a fence.

use std::collections::BTreeSet;

use tracing::info;

use super::{WorkerDeps, item_upsert};
use crate::engine::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::model::record::{RecordKind, RecordWrite};
use crate::upstream::SparqlResults;
use crate::upstream::sparql;

/// Upsert every current country and drop those no longer returned.
/// Returns the number of countries kept.
pub async fn refresh_country_list(deps: &WorkerDeps, ctx: &ExecutionContext) -> Result<usize> {
    let handler = ctx.rate_limit_handler();
    let results: SparqlResults = deps
        .client
        .query(&sparql::country_list(), handler.as_ref())
        .await?;

    let mut seen = BTreeSet::new();
    let mut writes = Vec::new();
    for row in &results.results.bindings {
        let id = row.item_id("item")?;
        if seen.insert(id.clone()) {
            writes.push(RecordWrite::Upsert(item_upsert(
                RecordKind::Country,
                &id,
                row.value("itemLabel"),
            )));
        }
    }
    // An empty answer is an upstream hiccup, not a world without countries.
    if seen.is_empty() {
        return Err(Error::Payload("country list query returned no rows".to_string()));
    }

    let count = seen.len();
    writes.push(RecordWrite::Prune {
        kind: RecordKind::Country,
        parent_id: None,
        keep: seen.into_iter().collect(),
    });
    deps.store.apply(writes).await?;

    info!(countries = count, "country list refreshed");
    Ok(count)
}
