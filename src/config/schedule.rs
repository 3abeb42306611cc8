//! Periodic schedule for the beat.
//!
//! ```toml
//! [[entry]]
//! task = "refresh_country_list"
//! every_secs = 86400
//!
//! [[entry]]
//! task = "queue_periodically"
//! operation = "labels"
//! every_secs = 60
//! threshold_days = 7
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::work::Task;
use crate::refresh::OperationRegistry;
use crate::refresh::staleness::default_threshold;

const SECS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduleEntry {
    pub task: String,
    #[serde(default)]
    pub operation: Option<String>,
    pub every_secs: u64,
    #[serde(default)]
    pub threshold_days: Option<i64>,
}

impl ScheduleEntry {
    pub fn every(&self) -> Duration {
        Duration::from_secs(self.every_secs)
    }

    /// The task this entry enqueues.
    pub fn to_task(&self) -> Result<Task> {
        match self.task.as_str() {
            "refresh_country_list" => Ok(Task::RefreshCountryList),
            "queue_periodically" => {
                let operation = self.operation.clone().ok_or_else(|| {
                    Error::Config("queue_periodically entry needs an operation".to_string())
                })?;
                let threshold_secs = match self.threshold_days {
                    Some(days) if days < 0 => {
                        return Err(Error::Config(format!(
                            "{operation}: threshold_days must not be negative, got {days}"
                        )));
                    }
                    Some(days) => days.saturating_mul(SECS_PER_DAY),
                    None => default_threshold().num_seconds(),
                };
                Ok(Task::QueuePeriodically {
                    operation,
                    threshold_secs,
                })
            }
            other => Err(Error::Config(format!("unknown scheduled task {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Schedule {
    #[serde(rename = "entry", default)]
    pub entries: Vec<ScheduleEntry>,
}

impl Schedule {
    /// Country list daily, every operation's queuing task each minute.
    pub fn standard(registry: &OperationRegistry) -> Self {
        let mut entries = vec![ScheduleEntry {
            task: "refresh_country_list".to_string(),
            operation: None,
            every_secs: SECS_PER_DAY as u64,
            threshold_days: None,
        }];
        entries.extend(registry.names().map(|name| ScheduleEntry {
            task: "queue_periodically".to_string(),
            operation: Some(name.to_string()),
            every_secs: 60,
            threshold_days: None,
        }));
        Self { entries }
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("bad schedule: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read schedule {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Resolve every entry against the registry.
    pub fn tasks(&self, registry: &OperationRegistry) -> Result<Vec<(Duration, Task)>> {
        self.entries
            .iter()
            .map(|entry| {
                if entry.every_secs == 0 {
                    return Err(Error::Config(format!(
                        "schedule entry {:?} has a zero interval",
                        entry.task
                    )));
                }
                let task = entry.to_task()?;
                if let Task::QueuePeriodically { operation, .. } = &task {
                    registry.get(operation)?;
                }
                Ok((entry.every(), task))
            })
            .collect()
    }
}
