//! Request/response transport to the query service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, RETRY_AFTER, USER_AGENT};
use tracing::debug;

use super::sparql::QueryDescriptor;
use crate::error::{Error, Result};

/// Outcome of one request that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamResponse {
    Payload(serde_json::Value),
    /// HTTP 429. `retry_after` is `None` when the header was absent or unreadable.
    Throttled { retry_after: Option<Duration> },
}

/// Issues a single query. Non-throttling failures are returned as errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, query: &QueryDescriptor) -> Result<UpstreamResponse>;
}

/// SPARQL-over-HTTP transport.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, user_agent: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            user_agent: user_agent.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, query: &QueryDescriptor) -> Result<UpstreamResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/sparql-results+json")
            .header(USER_AGENT, &self.user_agent)
            .form(&[("query", query.sparql.as_str())])
            .send()
            .await?;

        let status = response.status();
        debug!(query = %query.name, %status, "upstream responded");

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Ok(UpstreamResponse::Throttled { retry_after });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                query: query.name.clone(),
                status: Some(status.as_u16()),
                message: truncate(&body, 512),
            });
        }

        Ok(UpstreamResponse::Payload(response.json().await?))
    }
}

/// `Retry-After` in delta-seconds form. HTTP dates are not honoured.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
