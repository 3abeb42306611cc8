//! Refresh operation descriptors and the registry binding them to record kinds.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::model::record::RecordKind;
use crate::model::work::UPSTREAM_LANE;

/// How the dispatcher emits work for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchScope {
    /// One work item per claimed record.
    PerRecord,
    /// One work item per collection; the worker finds its records by token.
    Collection,
}

/// Everything the dispatcher needs to know about one refresh operation.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    /// Operation name, also the key of its `last_queued_at` fence.
    pub name: &'static str,
    /// Record collections this operation refreshes.
    pub kinds: Vec<RecordKind>,
    pub scope: DispatchScope,
    /// Lane the refresh work is queued on.
    pub lane: &'static str,
}

impl OperationDescriptor {
    pub fn new(name: &'static str, scope: DispatchScope, kinds: Vec<RecordKind>) -> Self {
        Self {
            name,
            kinds,
            scope,
            lane: UPSTREAM_LANE,
        }
    }

    pub fn lane(mut self, lane: &'static str) -> Self {
        self.lane = lane;
        self
    }

    pub fn applies_to(&self, kind: RecordKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Registry of operations, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<&'static str, OperationDescriptor>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The operations this service runs against Wikidata.
    pub fn standard() -> Self {
        let items: Vec<RecordKind> = RecordKind::ALL
            .into_iter()
            .filter(|kind| kind.is_wikidata_item())
            .collect();

        Self::new()
            .register(OperationDescriptor::new(
                "labels",
                DispatchScope::Collection,
                items,
            ))
            .register(OperationDescriptor::new(
                "legislatures",
                DispatchScope::PerRecord,
                vec![RecordKind::Country],
            ))
            .register(OperationDescriptor::new(
                "members",
                DispatchScope::PerRecord,
                vec![RecordKind::LegislativeHouse],
            ))
            .register(OperationDescriptor::new(
                "districts",
                DispatchScope::PerRecord,
                vec![RecordKind::LegislativeHouse],
            ))
    }

    /// Add (or replace) an operation.
    pub fn register(mut self, descriptor: OperationDescriptor) -> Self {
        self.operations.insert(descriptor.name, descriptor);
        self
    }

    pub fn get(&self, name: &str) -> Result<&OperationDescriptor> {
        self.operations
            .get(name)
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))
    }

    /// Look up an operation and check it covers `kind`.
    pub fn get_for_kind(&self, name: &str, kind: RecordKind) -> Result<&OperationDescriptor> {
        let descriptor = self.get(name)?;
        if descriptor.applies_to(kind) {
            Ok(descriptor)
        } else {
            Err(Error::KindNotRegistered {
                operation: name.to_string(),
                kind,
            })
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.operations.keys().copied()
    }
}
