//! Periodic queuing dispatcher.
//!
//! Stamps stale records with a fencing token and queues refresh work for
//! them. The stamp is the store's atomic conditional update, so any number
//! of dispatchers may run concurrently: a record is claimed by at most one
//! of them per staleness window.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use super::operation::{DispatchScope, OperationDescriptor, OperationRegistry};
use super::staleness;
use crate::engine::queue::TaskQueue;
use crate::error::{Error, Result};
use crate::model::record::RecordKind;
use crate::model::work::{Task, TaskEnvelope, WorkItem};
use crate::store::RecordStore;
use crate::telemetry::metrics;

/// What one dispatcher run did, per collection.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub operation: String,
    pub queued_at: DateTime<Utc>,
    pub collections: Vec<CollectionReport>,
}

#[derive(Debug, Clone)]
pub struct CollectionReport {
    pub kind: RecordKind,
    /// Records stamped by this run.
    pub claimed: u64,
    /// Work items enqueued.
    pub emitted: usize,
    /// Set when this collection failed; other collections still ran.
    pub error: Option<String>,
}

impl DispatchReport {
    pub fn claimed(&self) -> u64 {
        self.collections.iter().map(|c| c.claimed).sum()
    }

    pub fn emitted(&self) -> usize {
        self.collections.iter().map(|c| c.emitted).sum()
    }

    pub fn failed(&self) -> impl Iterator<Item = &CollectionReport> {
        self.collections.iter().filter(|c| c.error.is_some())
    }
}

pub struct PeriodicQueuingDispatcher {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<OperationRegistry>,
}

impl PeriodicQueuingDispatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
        }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Queue refresh work for every record stale under `operation`.
    ///
    /// Safe to run redundantly: a second run with no time passing claims
    /// nothing and emits nothing. A failing collection is logged and
    /// reported; the remaining collections still run.
    pub async fn run(&self, operation: &str, threshold: TimeDelta) -> Result<DispatchReport> {
        let descriptor = self.registry.get(operation)?;
        let now = staleness::fence_token(Utc::now());
        let cutoff = staleness::cutoff(now, threshold);

        let mut collections = Vec::with_capacity(descriptor.kinds.len());
        for &kind in &descriptor.kinds {
            let report = self.dispatch_collection(descriptor, kind, cutoff, now).await;
            if let Some(e) = &report.error {
                error!(operation, %kind, claimed = report.claimed, "dispatch failed for collection: {e}");
                metrics::dispatch_failures().add(1, &labels(operation, kind));
            }
            collections.push(report);
        }

        let report = DispatchReport {
            operation: operation.to_string(),
            queued_at: now,
            collections,
        };
        if report.claimed() > 0 {
            info!(
                operation,
                claimed = report.claimed(),
                emitted = report.emitted(),
                "queued stale records"
            );
        }
        Ok(report)
    }

    async fn dispatch_collection(
        &self,
        descriptor: &OperationDescriptor,
        kind: RecordKind,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CollectionReport {
        let mut report = CollectionReport {
            kind,
            claimed: 0,
            emitted: 0,
            error: None,
        };
        report.claimed = match self
            .store
            .claim_stale(kind, descriptor.name, cutoff, now)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                report.error = Some(e.to_string());
                return report;
            }
        };
        if report.claimed == 0 {
            // Nothing stale, or another run got there first.
            debug!(operation = descriptor.name, %kind, "nothing to queue");
            return report;
        }
        metrics::records_claimed().add(
            report.claimed,
            &[
                KeyValue::new("operation", descriptor.name),
                KeyValue::new("kind", kind.as_str()),
                KeyValue::new("trigger", "periodic"),
            ],
        );

        let ids = match descriptor.scope {
            DispatchScope::PerRecord => {
                match self.store.ids_queued_at(kind, descriptor.name, now).await {
                    Ok(ids) => ids,
                    Err(e) => {
                        self.release(descriptor, kind, &[], now).await;
                        report.error = Some(e.to_string());
                        return report;
                    }
                }
            }
            DispatchScope::Collection => Vec::new(),
        };
        let items = work_items(descriptor, kind, &ids, now);
        report.emitted = self.enqueue(descriptor, kind, &items).await;
        if report.emitted < items.len() {
            self.release(descriptor, kind, &items[report.emitted..], now)
                .await;
            report.error = Some(format!(
                "queued {} of {} work item(s); the rest were handed back",
                report.emitted,
                items.len()
            ));
        }
        report
    }

    /// Manual entry point: refresh `ids` (every record of `kind` if `None`)
    /// regardless of staleness. Returns the number of work items enqueued.
    pub async fn trigger_refresh(
        &self,
        operation: &str,
        kind: RecordKind,
        ids: Option<Vec<String>>,
    ) -> Result<usize> {
        let descriptor = self.registry.get_for_kind(operation, kind)?;
        let items = self.claim_now(operation, kind, ids.as_deref()).await?;
        if items.is_empty() {
            info!(operation, %kind, "no matching records to refresh");
            return Ok(0);
        }
        let emitted = self.enqueue(descriptor, kind, &items).await;
        if emitted < items.len() {
            self.release(descriptor, kind, &items[emitted..], items[0].queued_at)
                .await;
            return Err(Error::Other(format!(
                "queued {emitted} of {} work item(s) for {operation} on {kind}",
                items.len()
            )));
        }
        info!(operation, %kind, emitted, "refresh triggered");
        Ok(emitted)
    }

    /// Stamp `ids` (every record of `kind` if `None`) with a fresh token and
    /// return the work items covering them, without queuing anything.
    pub async fn claim_now(
        &self,
        operation: &str,
        kind: RecordKind,
        ids: Option<&[String]>,
    ) -> Result<Vec<WorkItem>> {
        let descriptor = self.registry.get_for_kind(operation, kind)?;
        let now = staleness::fence_token(Utc::now());

        let stamped = self.store.stamp(kind, operation, ids, now).await?;
        if stamped.is_empty() {
            return Ok(Vec::new());
        }
        metrics::records_claimed().add(
            stamped.len() as u64,
            &[
                KeyValue::new("operation", descriptor.name),
                KeyValue::new("kind", kind.as_str()),
                KeyValue::new("trigger", "manual"),
            ],
        );
        Ok(work_items(descriptor, kind, &stamped, now))
    }

    /// Clear the tokens of `ids` (every record of `kind` if `None`) so the
    /// next periodic run picks them up. Returns the number cleared.
    pub async fn clear_tokens(
        &self,
        operation: &str,
        kind: RecordKind,
        ids: Option<&[String]>,
    ) -> Result<u64> {
        self.registry.get_for_kind(operation, kind)?;
        let cleared = self.store.clear_queued(kind, operation, ids).await?;
        info!(operation, %kind, cleared, "refresh tokens cleared");
        Ok(cleared)
    }

    /// Enqueue `items` in order, stopping at the first failure. Returns how
    /// many were queued.
    async fn enqueue(
        &self,
        descriptor: &OperationDescriptor,
        kind: RecordKind,
        items: &[WorkItem],
    ) -> usize {
        let mut sent = 0;
        for item in items {
            let envelope = TaskEnvelope::new(Task::Refresh { item: item.clone() });
            if let Err(e) = self.queue.enqueue(descriptor.lane, &envelope, None).await {
                warn!(operation = descriptor.name, %kind, item = %item, "enqueue failed: {e}");
                break;
            }
            sent += 1;
        }
        metrics::work_items_emitted().add(sent as u64, &labels(descriptor.name, kind));
        sent
    }

    /// Hand back the claim on records whose work never made it into the
    /// queue, so the next run sees them as stale again. With no per-record
    /// items to go on, every record still carrying `queued_at` is released.
    async fn release(
        &self,
        descriptor: &OperationDescriptor,
        kind: RecordKind,
        unsent: &[WorkItem],
        queued_at: DateTime<Utc>,
    ) {
        let ids: Option<Vec<String>> = match descriptor.scope {
            DispatchScope::PerRecord if !unsent.is_empty() => {
                Some(unsent.iter().filter_map(|i| i.record_id.clone()).collect())
            }
            _ => None,
        };
        match self
            .store
            .release_claim(kind, descriptor.name, ids.as_deref(), queued_at)
            .await
        {
            Ok(released) => {
                warn!(operation = descriptor.name, %kind, released, "released claim on unqueued records")
            }
            Err(e) => error!(
                operation = descriptor.name,
                %kind,
                "could not release claim, records wait for the next window: {e}"
            ),
        }
    }
}

/// One item per id for per-record operations, a single item for collection
/// operations.
fn work_items(
    descriptor: &OperationDescriptor,
    kind: RecordKind,
    ids: &[String],
    queued_at: DateTime<Utc>,
) -> Vec<WorkItem> {
    match descriptor.scope {
        DispatchScope::PerRecord => ids
            .iter()
            .map(|id| WorkItem::for_record(descriptor.name, kind, id.clone(), queued_at))
            .collect(),
        DispatchScope::Collection => {
            vec![WorkItem::for_collection(descriptor.name, kind, queued_at)]
        }
    }
}

fn labels(operation: &str, kind: RecordKind) -> [KeyValue; 2] {
    [
        KeyValue::new("operation", operation.to_string()),
        KeyValue::new("kind", kind.as_str()),
    ]
}
