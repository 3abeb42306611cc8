//! Rate-limited query client.
//!
//! Throttled requests are retried after the server-suggested delay, up to
//! a bounded number of attempts. While a call is backing off it holds its
//! lane suspended so the process stops taking on more upstream work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use tracing::{Instrument, error, info, warn};

use super::sparql::QueryDescriptor;
use super::transport::{Transport, UpstreamResponse};
use crate::error::{Error, Result};
use crate::lane::{LaneGuard, RateLimitHandler};
use crate::telemetry::{metrics, refresh::start_query_span};

/// Retry budget for throttled requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    /// Backoff used when a 429 carries no usable `Retry-After`.
    pub default_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            default_retry_after: Duration::from_secs(60),
        }
    }
}

pub struct RateLimitedQueryClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RateLimitedQueryClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `query` with the configured retry budget and decode the payload.
    pub async fn query<T: DeserializeOwned>(
        &self,
        query: &QueryDescriptor,
        handler: Option<&RateLimitHandler>,
    ) -> Result<T> {
        self.query_with_retries(query, self.policy.max_retries, handler)
            .await
    }

    /// Run `query` allowing at most `max_retries` attempts (at least one).
    ///
    /// On the first throttle the handler's lane is suspended; it is resumed
    /// exactly once before this returns, whatever the outcome. Without a
    /// handler (direct invocation) no lane is touched.
    pub async fn query_with_retries<T: DeserializeOwned>(
        &self,
        query: &QueryDescriptor,
        max_retries: u32,
        handler: Option<&RateLimitHandler>,
    ) -> Result<T> {
        let lane = handler.map(|h| h.lane()).unwrap_or("-");
        let span = start_query_span(&query.name, lane);

        async {
            let started = Instant::now();
            let mut guard = LaneGuard::new(handler);
            let outcome = self.attempts(query, max_retries.max(1), &mut guard).await;
            guard.release().await;

            metrics::operation_duration_ms().record(
                started.elapsed().as_millis() as f64,
                &[KeyValue::new("operation", "upstream.query")],
            );
            serde_json::from_value(outcome?)
                .map_err(|e| Error::Payload(format!("{}: {e}", query.name)))
        }
        .instrument(span)
        .await
    }

    async fn attempts(
        &self,
        query: &QueryDescriptor,
        max_retries: u32,
        guard: &mut LaneGuard<'_>,
    ) -> Result<serde_json::Value> {
        let mut attempt = 1;
        loop {
            match self.transport.execute(query).await {
                Ok(UpstreamResponse::Payload(payload)) => {
                    record_request(query, "ok");
                    if attempt > 1 {
                        info!(query = %query.name, attempt, "upstream query succeeded after throttling");
                    }
                    return Ok(payload);
                }
                Ok(UpstreamResponse::Throttled { retry_after }) => {
                    record_request(query, "throttled");
                    let wait = retry_after.unwrap_or(self.policy.default_retry_after);
                    guard.hold().await;

                    if attempt >= max_retries {
                        error!(
                            query = %query.name,
                            attempts = attempt,
                            "upstream still throttling, giving up"
                        );
                        return Err(Error::UpstreamThrottled {
                            query: query.name.clone(),
                            attempts: attempt,
                            retry_after: wait,
                        });
                    }

                    warn!(
                        query = %query.name,
                        attempt,
                        max_retries,
                        retry_after_secs = wait.as_secs_f64(),
                        "upstream throttled, backing off"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    record_request(query, "error");
                    error!(query = %query.name, sparql = %query.sparql, attempt, "upstream query failed: {e}");
                    return Err(e);
                }
            }
        }
    }
}

fn record_request(query: &QueryDescriptor, outcome: &'static str) {
    metrics::upstream_requests().add(
        1,
        &[
            KeyValue::new("query", query.name.clone()),
            KeyValue::new("outcome", outcome),
        ],
    );
}
