//! # commons-refresh
//!
//! Keeps a Postgres store of Wikidata-sourced records fresh.
//!
//! A periodic dispatcher stamps stale records with a fencing token and
//! queues refresh work (pgmq). Workers query the Wikidata Query Service
//! through a rate-limited client that pauses its lane while throttled, and
//! only write results whose token is still current.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod lane;
pub mod model;
pub mod refresh;
pub mod store;
pub mod telemetry;
pub mod upstream;
pub mod worker;
