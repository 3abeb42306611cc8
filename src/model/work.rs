//! Work items and the task envelope carried through the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{Fence, RecordKind};

/// Lane for queuing and bookkeeping tasks.
pub const DEFAULT_LANE: &str = "default";

/// Lane for tasks that query the Wikidata Query Service.
pub const UPSTREAM_LANE: &str = "wdqs";

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// One fenced unit of refresh work.
///
/// With `record_id` set the item targets a single record. Without it the
/// item covers every record of `kind` whose token equals `queued_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub operation: String,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// Fencing token stamped at dispatch.
    pub queued_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn for_record(
        operation: &str,
        kind: RecordKind,
        id: impl Into<String>,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            operation: operation.to_string(),
            kind,
            record_id: Some(id.into()),
            queued_at,
        }
    }

    pub fn for_collection(operation: &str, kind: RecordKind, queued_at: DateTime<Utc>) -> Self {
        Self {
            operation: operation.to_string(),
            kind,
            record_id: None,
            queued_at,
        }
    }

    /// The fence a write to record `id` under this item must match.
    pub fn fence(&self, id: &str) -> Fence {
        Fence {
            kind: self.kind,
            id: id.to_string(),
            operation: self.operation.clone(),
            queued_at: self.queued_at,
        }
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.record_id {
            Some(id) => write!(f, "{}:{}/{}", self.operation, self.kind, id),
            None => write!(f, "{}:{}/*", self.operation, self.kind),
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Named units of work understood by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Run the periodic queuing dispatcher for one operation.
    QueuePeriodically {
        operation: String,
        threshold_secs: i64,
    },
    /// Execute one work item with the operation's refresh worker.
    Refresh { item: WorkItem },
    /// Re-sync the list of countries wholesale.
    RefreshCountryList,
}

impl Task {
    pub fn name(&self) -> String {
        match self {
            Task::QueuePeriodically { operation, .. } => format!("{operation}.queue_periodically"),
            Task::Refresh { item } => format!("{}.refresh", item.operation),
            Task::RefreshCountryList => "country_list.refresh".to_string(),
        }
    }
}

/// What actually travels through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    #[serde(flatten)]
    pub task: Task,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(task: Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            enqueued_at: Utc::now(),
        }
    }
}
