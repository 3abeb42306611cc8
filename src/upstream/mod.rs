//! Upstream knowledge source: Wikidata Query Service.

pub mod client;
pub mod sparql;
pub mod transport;

pub use client::{RateLimitedQueryClient, RetryPolicy};
pub use sparql::{Binding, QueryDescriptor, SparqlResults};
pub use transport::{HttpTransport, Transport, UpstreamResponse};
