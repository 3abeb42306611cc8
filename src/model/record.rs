//! Record types shared by the store, the dispatcher and the workers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Record kinds
// ---------------------------------------------------------------------------

/// Entity kinds held in the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Country,
    AdministrativeArea,
    LegislativeHouse,
    LegislativeTerm,
    Position,
    Person,
    Organization,
    ElectoralDistrict,
    Term,
    /// Legislative membership, keyed by Wikidata statement id rather than item id.
    Membership,
}

impl RecordKind {
    pub const ALL: [RecordKind; 10] = [
        RecordKind::Country,
        RecordKind::AdministrativeArea,
        RecordKind::LegislativeHouse,
        RecordKind::LegislativeTerm,
        RecordKind::Position,
        RecordKind::Person,
        RecordKind::Organization,
        RecordKind::ElectoralDistrict,
        RecordKind::Term,
        RecordKind::Membership,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Country => "country",
            RecordKind::AdministrativeArea => "administrative_area",
            RecordKind::LegislativeHouse => "legislative_house",
            RecordKind::LegislativeTerm => "legislative_term",
            RecordKind::Position => "position",
            RecordKind::Person => "person",
            RecordKind::Organization => "organization",
            RecordKind::ElectoralDistrict => "electoral_district",
            RecordKind::Term => "term",
            RecordKind::Membership => "membership",
        }
    }

    /// Whether records of this kind are Wikidata items (`Q…` ids with labels).
    pub fn is_wikidata_item(self) -> bool {
        self != RecordKind::Membership
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown record kind: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A stored record. `data` is an arbitrary JSON object owned by the workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,
    pub id: String,
    /// Language code → label.
    pub labels: BTreeMap<String, String>,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(kind: RecordKind, id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            kind,
            id: id.into(),
            labels: BTreeMap::new(),
            data: serde_json::Map::new(),
            parent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn label(mut self, lang: &str, label: &str) -> Self {
        self.labels.insert(lang.to_string(), label.to_string());
        self
    }

    pub fn parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

/// Restricts `RecordStore::select`.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub ids: Option<Vec<String>>,
    pub parent_id: Option<String>,
}

impl RecordFilter {
    pub fn ids(ids: Vec<String>) -> Self {
        Self {
            ids: Some(ids),
            parent_id: None,
        }
    }

    pub fn parent(parent_id: &str) -> Self {
        Self {
            ids: None,
            parent_id: Some(parent_id.to_string()),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        let id_ok = self.ids.as_ref().is_none_or(|ids| ids.contains(&record.id));
        let parent_ok = self
            .parent_id
            .as_ref()
            .is_none_or(|p| record.parent_id.as_deref() == Some(p.as_str()));
        id_ok && parent_ok
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Insert-or-merge of one record. Labels and data are merged key by key;
/// `parent_id` is only overwritten when given.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpsert {
    pub kind: RecordKind,
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub parent_id: Option<String>,
}

impl RecordUpsert {
    pub fn new(kind: RecordKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            labels: BTreeMap::new(),
            data: serde_json::Map::new(),
            parent_id: None,
        }
    }

    pub fn label(mut self, lang: &str, label: &str) -> Self {
        self.labels.insert(lang.to_string(), label.to_string());
        self
    }

    pub fn parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    Upsert(RecordUpsert),
    /// Replace a record's labels wholesale. No-op if the record is gone.
    SetLabels {
        kind: RecordKind,
        id: String,
        labels: BTreeMap<String, String>,
    },
    /// Delete records of `kind` (under `parent_id`, if given) whose id is not in `keep`.
    Prune {
        kind: RecordKind,
        parent_id: Option<String>,
        keep: Vec<String>,
    },
}

impl RecordUpsert {
    /// Apply this upsert to an existing record (or a fresh one).
    pub fn merge_into(&self, record: &mut Record) {
        record
            .labels
            .extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        record
            .data
            .extend(self.data.iter().map(|(k, v)| (k.clone(), v.clone())));
        if self.parent_id.is_some() {
            record.parent_id = self.parent_id.clone();
        }
        record.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Fencing
// ---------------------------------------------------------------------------

/// The fencing token a write must still match: `last_queued_at[operation]`
/// of record `(kind, id)` must equal `queued_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub kind: RecordKind,
    pub id: String,
    pub operation: String,
    pub queued_at: DateTime<Utc>,
}

/// Result of a fenced write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceOutcome {
    Applied,
    /// The record was re-queued (or cleared) since this work was dispatched.
    /// Nothing was written.
    StaleDispatch { current: Option<DateTime<Utc>> },
}

impl FenceOutcome {
    pub fn check(expected: DateTime<Utc>, current: Option<DateTime<Utc>>) -> Self {
        if current == Some(expected) {
            FenceOutcome::Applied
        } else {
            FenceOutcome::StaleDispatch { current }
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, FenceOutcome::Applied)
    }
}
