//! In-memory record store. Every call holds one lock for its whole duration,
//! which makes each trait operation atomic.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::RecordStore;
use crate::error::{Error, Result};
use crate::model::record::{Fence, FenceOutcome, Record, RecordFilter, RecordKind, RecordWrite};

type FenceKey = (RecordKind, String, String);

#[derive(Default)]
struct State {
    records: BTreeMap<(RecordKind, String), Record>,
    tokens: HashMap<FenceKey, DateTime<Utc>>,
}

impl State {
    fn ids_of(&self, kind: RecordKind) -> impl Iterator<Item = &String> {
        self.records
            .keys()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, id)| id)
    }

    fn token(&self, kind: RecordKind, id: &str, operation: &str) -> Option<DateTime<Utc>> {
        self.tokens
            .get(&(kind, id.to_string(), operation.to_string()))
            .copied()
    }

    fn apply(&mut self, write: RecordWrite) {
        match write {
            RecordWrite::Upsert(upsert) => {
                let record = self
                    .records
                    .entry((upsert.kind, upsert.id.clone()))
                    .or_insert_with(|| Record::new(upsert.kind, upsert.id.clone()));
                upsert.merge_into(record);
            }
            RecordWrite::SetLabels { kind, id, labels } => {
                if let Some(record) = self.records.get_mut(&(kind, id)) {
                    record.labels = labels;
                    record.updated_at = Utc::now();
                }
            }
            RecordWrite::Prune {
                kind,
                parent_id,
                keep,
            } => {
                self.records.retain(|(k, id), record| {
                    *k != kind
                        || keep.contains(id)
                        || (parent_id.is_some() && record.parent_id != parent_id)
                });
                let records = &self.records;
                self.tokens
                    .retain(|(k, id, _), _| records.contains_key(&(*k, id.clone())));
            }
        }
    }
}

/// Record store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub async fn insert(&self, record: Record) {
        let mut state = self.state.lock().await;
        state
            .records
            .insert((record.kind, record.id.clone()), record);
    }

    /// Set (or clear) a record's token directly, bypassing the forward-only rule.
    pub async fn set_last_queued(
        &self,
        kind: RecordKind,
        id: &str,
        operation: &str,
        queued_at: Option<DateTime<Utc>>,
    ) {
        let mut state = self.state.lock().await;
        let key = (kind, id.to_string(), operation.to_string());
        match queued_at {
            Some(ts) => state.tokens.insert(key, ts),
            None => state.tokens.remove(&key),
        };
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn claim_stale(
        &self,
        kind: RecordKind,
        operation: &str,
        cutoff: DateTime<Utc>,
        queued_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .ids_of(kind)
            .filter(|id| state.token(kind, id, operation).is_none_or(|t| t < cutoff))
            .cloned()
            .collect();
        for id in &stale {
            state
                .tokens
                .insert((kind, id.clone(), operation.to_string()), queued_at);
        }
        Ok(stale.len() as u64)
    }

    async fn ids_queued_at(
        &self,
        kind: RecordKind,
        operation: &str,
        queued_at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .ids_of(kind)
            .filter(|id| state.token(kind, id, operation) == Some(queued_at))
            .cloned()
            .collect())
    }

    async fn stamp(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
        queued_at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let stamped: Vec<String> = state
            .ids_of(kind)
            .filter(|id| ids.is_none_or(|wanted| wanted.contains(id)))
            .filter(|id| state.token(kind, id, operation).is_none_or(|t| t < queued_at))
            .cloned()
            .collect();
        for id in &stamped {
            state
                .tokens
                .insert((kind, id.clone(), operation.to_string()), queued_at);
        }
        Ok(stamped)
    }

    async fn release_claim(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
        queued_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.tokens.len();
        state.tokens.retain(|(k, id, op), token| {
            !(*k == kind
                && op == operation
                && *token == queued_at
                && ids.is_none_or(|wanted| wanted.contains(id)))
        });
        Ok((before - state.tokens.len()) as u64)
    }

    async fn clear_queued(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.tokens.len();
        state.tokens.retain(|(k, id, op), _| {
            !(*k == kind && op == operation && ids.is_none_or(|wanted| wanted.contains(id)))
        });
        Ok((before - state.tokens.len()) as u64)
    }

    async fn last_queued_at(
        &self,
        kind: RecordKind,
        id: &str,
        operation: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().await.token(kind, id, operation))
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Record> {
        self.state
            .lock()
            .await
            .records
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))
    }

    async fn select(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<Record>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.kind == kind && filter.matches(r))
            .cloned()
            .collect())
    }

    async fn apply_fenced(&self, fence: &Fence, writes: Vec<RecordWrite>) -> Result<FenceOutcome> {
        let mut state = self.state.lock().await;
        let outcome = FenceOutcome::check(
            fence.queued_at,
            state.token(fence.kind, &fence.id, &fence.operation),
        );
        if outcome.is_applied() {
            for write in writes {
                state.apply(write);
            }
        }
        Ok(outcome)
    }

    async fn apply(&self, writes: Vec<RecordWrite>) -> Result<()> {
        let mut state = self.state.lock().await;
        for write in writes {
            state.apply(write);
        }
        Ok(())
    }
}
