//! Record store interface.
//!
//! The conditional stamp in [`RecordStore::claim_stale`] and the fenced
//! write in [`RecordStore::apply_fenced`] are the only synchronization
//! points between dispatchers and workers. Implementations must make each
//! of them atomic at the storage layer.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::record::{Fence, FenceOutcome, Record, RecordFilter, RecordKind, RecordWrite};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Set `last_queued_at[operation] = queued_at` on every record of `kind`
    /// whose token is missing or older than `cutoff`, evaluating the
    /// predicate at write time. Returns the number of records stamped.
    async fn claim_stale(
        &self,
        kind: RecordKind,
        operation: &str,
        cutoff: DateTime<Utc>,
        queued_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Ids of records of `kind` whose token equals `queued_at`, sorted.
    async fn ids_queued_at(
        &self,
        kind: RecordKind,
        operation: &str,
        queued_at: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Stamp `queued_at` on the given records (all of `kind` when `ids` is
    /// `None`), skipping any whose token is already at or past it. Returns
    /// the ids stamped, sorted.
    async fn stamp(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
        queued_at: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Clear tokens of `kind` that still equal `queued_at` (only on `ids`,
    /// if given). Hands a claim back when its work could not be queued.
    async fn release_claim(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
        queued_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Clear tokens so the records become eligible on the next dispatch.
    async fn clear_queued(
        &self,
        kind: RecordKind,
        operation: &str,
        ids: Option<&[String]>,
    ) -> Result<u64>;

    async fn last_queued_at(
        &self,
        kind: RecordKind,
        id: &str,
        operation: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Fetch one record. `Error::NotFound` if absent.
    async fn get(&self, kind: RecordKind, id: &str) -> Result<Record>;

    /// Records of `kind` matching `filter`, sorted by id.
    async fn select(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<Record>>;

    /// Apply `writes` atomically, but only if the fence still holds.
    async fn apply_fenced(&self, fence: &Fence, writes: Vec<RecordWrite>) -> Result<FenceOutcome>;

    /// Apply `writes` atomically without a fence.
    async fn apply(&self, writes: Vec<RecordWrite>) -> Result<()>;
}
