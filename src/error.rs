//! Error types for commons-refresh.

use std::time::Duration;

use thiserror::Error;

use crate::model::record::RecordKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("unknown refresh operation: {0}")]
    UnknownOperation(String),

    #[error("operation {operation} is not registered for {kind}")]
    KindNotRegistered {
        operation: String,
        kind: RecordKind,
    },

    /// Every attempt was throttled; carries the last server-suggested wait.
    #[error("upstream throttled {query} after {attempts} attempt(s), last retry-after {retry_after:?}")]
    UpstreamThrottled {
        query: String,
        attempts: u32,
        retry_after: Duration,
    },

    #[error("upstream error for {query}: {message}")]
    Upstream {
        query: String,
        status: Option<u16>,
        message: String,
    },

    #[error("unexpected upstream payload: {0}")]
    Payload(String),

    #[error("lane control error: {0}")]
    LaneControl(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error came from upstream throttling that outlived the retry budget.
    pub fn is_throttled(&self) -> bool {
        matches!(self, Error::UpstreamThrottled { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
