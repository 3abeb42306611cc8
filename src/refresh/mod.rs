//! Staleness-driven refresh scheduling.

pub mod dispatcher;
pub mod operation;
pub mod staleness;

pub use dispatcher::{CollectionReport, DispatchReport, PeriodicQueuingDispatcher};
pub use operation::{DispatchScope, OperationDescriptor, OperationRegistry};
