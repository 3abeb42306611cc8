//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use commons_refresh::engine::TaskQueue;
use commons_refresh::error::{Error, Result};
use commons_refresh::lane::{LaneController, LaneCoordinator, RateLimitHandler};
use commons_refresh::model::record::{
    Fence, FenceOutcome, Record, RecordFilter, RecordKind, RecordWrite,
};
use commons_refresh::model::work::{Task, TaskEnvelope, WorkItem};
use commons_refresh::store::{MemoryStore, RecordStore};
use commons_refresh::upstream::{
    QueryDescriptor, RateLimitedQueryClient, RetryPolicy, Transport, UpstreamResponse,
};
use commons_refresh::worker::WorkerDeps;
use serde_json::{Value, json};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Task queue that remembers what was sent, in order.
#[derive(Default)]
pub struct RecordingQueue {
    sent: Mutex<Vec<(String, TaskEnvelope)>>,
}

impl RecordingQueue {
    pub async fn sent(&self) -> Vec<(String, TaskEnvelope)> {
        self.sent.lock().await.clone()
    }

    /// Refresh work items sent, in order.
    pub async fn items(&self) -> Vec<WorkItem> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|(_, envelope)| match &envelope.task {
                Task::Refresh { item } => Some(item.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(
        &self,
        lane: &str,
        envelope: &TaskEnvelope,
        _delay: Option<Duration>,
    ) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((lane.to_string(), envelope.clone()));
        Ok(())
    }
}

/// Queue accepting a fixed number of sends, then failing every one.
pub struct FlakyQueue {
    remaining: AtomicUsize,
}

impl FlakyQueue {
    pub fn accepting(sends: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(sends),
        }
    }
}

#[async_trait]
impl TaskQueue for FlakyQueue {
    async fn enqueue(
        &self,
        _lane: &str,
        _envelope: &TaskEnvelope,
        _delay: Option<Duration>,
    ) -> Result<()> {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| Error::Other("queue down".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Transport answering from a script, one response per request.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<UpstreamResponse>>>,
    queries: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<UpstreamResponse>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Names of the queries received, in order.
    pub async fn queries(&self) -> Vec<String> {
        self.queries.lock().await.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, query: &QueryDescriptor) -> Result<UpstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().await.push(query.name.clone());
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(Error::Other("script exhausted".to_string())))
    }
}

pub fn throttled(secs: u64) -> Result<UpstreamResponse> {
    Ok(UpstreamResponse::Throttled {
        retry_after: Some(Duration::from_secs(secs)),
    })
}

pub fn payload(rows: Vec<Value>) -> Result<UpstreamResponse> {
    Ok(UpstreamResponse::Payload(sparql(rows)))
}

// ---------------------------------------------------------------------------
// SPARQL JSON
// ---------------------------------------------------------------------------

pub fn sparql(rows: Vec<Value>) -> Value {
    json!({"head": {"vars": []}, "results": {"bindings": rows}})
}

pub fn item(id: &str) -> Value {
    json!({"type": "uri", "value": format!("http://www.wikidata.org/entity/{id}")})
}

pub fn statement(id: &str) -> Value {
    json!({"type": "uri", "value": format!("http://www.wikidata.org/entity/statement/{id}")})
}

pub fn literal(value: &str) -> Value {
    json!({"type": "literal", "value": value})
}

pub fn text(value: &str, lang: &str) -> Value {
    json!({"type": "literal", "value": value, "xml:lang": lang})
}

// ---------------------------------------------------------------------------
// Lanes
// ---------------------------------------------------------------------------

/// Lane controller that records every call as `"suspend wdqs"` etc.
#[derive(Default)]
pub struct RecordingLaneController {
    calls: std::sync::Mutex<Vec<String>>,
}

impl RecordingLaneController {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, action: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(action))
            .count()
    }

    fn push(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl LaneController for RecordingLaneController {
    async fn suspend(&self, lane: &str, _worker_id: &str) -> Result<()> {
        self.push(format!("suspend {lane}"));
        Ok(())
    }

    async fn resume(&self, lane: &str, _worker_id: &str) -> Result<()> {
        self.push(format!("resume {lane}"));
        Ok(())
    }
}

/// Lane controller whose every call fails.
#[derive(Default)]
pub struct BrokenLaneController {
    attempts: AtomicUsize,
}

impl BrokenLaneController {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LaneController for BrokenLaneController {
    async fn suspend(&self, lane: &str, _worker_id: &str) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::LaneControl(format!("cannot suspend {lane}")))
    }

    async fn resume(&self, lane: &str, _worker_id: &str) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::LaneControl(format!("cannot resume {lane}")))
    }
}

/// A handler on the `wdqs` lane backed by a recording controller.
pub fn recording_handler() -> (Arc<RecordingLaneController>, Arc<LaneCoordinator>, RateLimitHandler) {
    let controller = Arc::new(RecordingLaneController::default());
    let coordinator = Arc::new(LaneCoordinator::new(controller.clone(), "worker-1"));
    let handler = RateLimitHandler::new(Arc::clone(&coordinator), "wdqs");
    (controller, coordinator, handler)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Store whose `claim_stale` fails for one kind; everything else delegates.
pub struct FailingStore {
    pub inner: MemoryStore,
    pub failing: RecordKind,
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn claim_stale(
        &self,
        kind: RecordKind,
        operation: &str,
        cutoff: DateTime<Utc>,
        queued_at: DateTime<Utc>,
    ) -> Result<u64> {
        if kind == self.failing {
            return Err(Error::Other(format!("{kind} collection unavailable")));
        }
        self.inner
            .claim_stale(kind, operation, cutoff, queued_at)
            .await
    }

    async fn ids_queued_at(
        &self,
        kind: RecordKind,
        operation: &str,
        queued_at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.inner.ids_queued_at(kind, operation, queued_at).await
    }

    async fn stamp(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
        queued_at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.inner.stamp(kind, operation, ids, queued_at).await
    }

    async fn release_claim(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
        queued_at: DateTime<Utc>,
    ) -> Result<u64> {
        self.inner
            .release_claim(kind, operation, ids, queued_at)
            .await
    }

    async fn clear_queued(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
    ) -> Result<u64> {
        self.inner.clear_queued(kind, operation, ids).await
    }

    async fn last_queued_at(
        &self,
        kind: RecordKind,
        id: &str,
        operation: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.last_queued_at(kind, id, operation).await
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Record> {
        self.inner.get(kind, id).await
    }

    async fn select(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<Record>> {
        self.inner.select(kind, filter).await
    }

    async fn apply_fenced(&self, fence: &Fence, writes: Vec<RecordWrite>) -> Result<FenceOutcome> {
        self.inner.apply_fenced(fence, writes).await
    }

    async fn apply(&self, writes: Vec<RecordWrite>) -> Result<()> {
        self.inner.apply(writes).await
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

pub fn worker_deps(store: Arc<dyn RecordStore>, transport: Arc<dyn Transport>) -> WorkerDeps {
    let client = RateLimitedQueryClient::new(transport, RetryPolicy::default());
    WorkerDeps::new(store, Arc::new(client))
}
