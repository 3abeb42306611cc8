//! Core data model.
//!
//! Records are Wikidata-sourced entities kept fresh by the refresh
//! operations; work items are the fenced units of refresh work that flow
//! through the queue.

pub mod record;
pub mod work;
