//! Refresh workers: one per operation.
//!
//! A worker re-reads the records a work item targets, queries upstream, and
//! writes results back only under the item's fence. A record whose token
//! moved on since dispatch is skipped (stale dispatch), independently of its
//! siblings in the same item.

pub mod country;
pub mod labels;
pub mod legislature;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::debug;

use crate::engine::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::model::record::{RecordKind, RecordUpsert, RecordWrite};
use crate::model::work::WorkItem;
use crate::store::RecordStore;
use crate::telemetry::metrics;
use crate::upstream::RateLimitedQueryClient;

/// Per-record tally of one work item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Records whose results were written.
    pub written: usize,
    /// Records skipped because their token no longer matched.
    pub stale: usize,
}

impl RefreshOutcome {
    pub fn stale() -> Self {
        Self {
            written: 0,
            stale: 1,
        }
    }

    fn count(&mut self, applied: bool) {
        if applied {
            self.written += 1;
        } else {
            self.stale += 1;
        }
    }
}

#[async_trait]
pub trait RefreshWorker: Send + Sync {
    /// Operation this worker executes.
    fn operation(&self) -> &'static str;

    async fn refresh(&self, item: &WorkItem, ctx: &ExecutionContext) -> Result<RefreshOutcome>;
}

/// What every worker needs.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn RecordStore>,
    pub client: Arc<RateLimitedQueryClient>,
}

impl WorkerDeps {
    pub fn new(store: Arc<dyn RecordStore>, client: Arc<RateLimitedQueryClient>) -> Self {
        Self { store, client }
    }

    /// Whether record `id` still carries the item's token. Lets per-record
    /// workers skip the upstream query for superseded work.
    async fn still_current(&self, item: &WorkItem, id: &str) -> Result<bool> {
        let current = self
            .store
            .last_queued_at(item.kind, id, &item.operation)
            .await?;
        let ok = current == Some(item.queued_at);
        if !ok {
            stale_dispatch(item, id);
        }
        Ok(ok)
    }

    /// Write under the item's fence for record `id`. Returns whether it applied.
    async fn write_fenced(&self, item: &WorkItem, id: &str, writes: Vec<RecordWrite>) -> Result<bool> {
        let outcome = self.store.apply_fenced(&item.fence(id), writes).await?;
        if !outcome.is_applied() {
            stale_dispatch(item, id);
        }
        Ok(outcome.is_applied())
    }
}

fn stale_dispatch(item: &WorkItem, id: &str) {
    debug!(operation = %item.operation, kind = %item.kind, id, queued_at = %item.queued_at, "stale dispatch, skipping record");
    metrics::stale_dispatches().add(
        1,
        &[
            KeyValue::new("operation", item.operation.clone()),
            KeyValue::new("kind", item.kind.as_str()),
        ],
    );
}

fn require_record_id(item: &WorkItem) -> Result<&str> {
    item.record_id
        .as_deref()
        .ok_or_else(|| Error::Other(format!("{} needs a record id", item.operation)))
}

/// Upsert of a Wikidata item carrying an English label, if one was returned.
fn item_upsert(kind: RecordKind, id: &str, label: Option<&str>) -> RecordUpsert {
    let upsert = RecordUpsert::new(kind, id);
    match label {
        Some(label) => upsert.label("en", label),
        None => upsert,
    }
}

/// Workers by operation name.
#[derive(Default)]
pub struct WorkerSet {
    workers: HashMap<&'static str, Arc<dyn RefreshWorker>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers for every standard operation.
    pub fn standard(deps: WorkerDeps) -> Self {
        Self::new()
            .with(Arc::new(labels::LabelsWorker::new(deps.clone())))
            .with(Arc::new(legislature::LegislaturesWorker::new(deps.clone())))
            .with(Arc::new(legislature::MembersWorker::new(deps.clone())))
            .with(Arc::new(legislature::DistrictsWorker::new(deps)))
    }

    pub fn with(mut self, worker: Arc<dyn RefreshWorker>) -> Self {
        self.workers.insert(worker.operation(), worker);
        self
    }

    pub fn get(&self, operation: &str) -> Result<&Arc<dyn RefreshWorker>> {
        self.workers
            .get(operation)
            .ok_or_else(|| Error::UnknownOperation(operation.to_string()))
    }

    pub async fn execute(&self, item: &WorkItem, ctx: &ExecutionContext) -> Result<RefreshOutcome> {
        self.get(&item.operation)?.refresh(item, ctx).await
    }
}
