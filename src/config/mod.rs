//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in secrecy::SecretString to keep it out of logs.

pub mod schedule;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::upstream::RetryPolicy;
use secrecy::SecretString;

pub const DEFAULT_WDQS_URL: &str = "https://query.wikidata.org/sparql";
pub const DEFAULT_USER_AGENT: &str = concat!(
    "commons-refresh/",
    env!("CARGO_PKG_VERSION"),
    " (Wikidata refresh worker)"
);

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub wdqs_url: String,
    pub wdqs_user_agent: String,
    pub retry: RetryPolicy,
    pub worker_id: String,
    pub schedule_file: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = RetryPolicy::default();
        let max_retries = match lookup("WDQS_RETRIES") {
            Some(v) => parse_var("WDQS_RETRIES", &v)?,
            None => defaults.max_retries,
        };
        let default_retry_after = match lookup("WDQS_DEFAULT_RETRY_AFTER") {
            Some(v) => Duration::from_secs(parse_var("WDQS_DEFAULT_RETRY_AFTER", &v)?),
            None => defaults.default_retry_after,
        };

        Ok(Self {
            database_url: SecretString::from(
                lookup("DATABASE_URL").ok_or_else(|| missing("DATABASE_URL"))?,
            ),
            wdqs_url: lookup("WDQS_URL").unwrap_or_else(|| DEFAULT_WDQS_URL.to_string()),
            wdqs_user_agent: lookup("WDQS_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            retry: RetryPolicy {
                max_retries,
                default_retry_after,
            },
            worker_id: lookup("WORKER_ID")
                .or_else(|| lookup("HOSTNAME"))
                .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple())),
            schedule_file: lookup("SCHEDULE_FILE").map(PathBuf::from),
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn missing(name: &str) -> Error {
    Error::Config(format!("required environment variable {name} is not set"))
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={value:?}: {e}")))
}
