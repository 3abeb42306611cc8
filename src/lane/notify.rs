//! Remote lane control over Postgres `NOTIFY`.
//!
//! Commands are broadcast on [`LANE_CONTROL_CHANNEL`]; every runner listens
//! and applies the ones addressed to its worker id.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::LaneController;
use crate::db::Db;
use crate::error::{Error, Result};

pub const LANE_CONTROL_CHANNEL: &str = "lane_control";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneCommand {
    Suspend,
    Resume,
}

/// Payload of a `lane_control` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneControlMessage {
    pub command: LaneCommand,
    pub lane: String,
    pub worker_id: String,
}

impl LaneControlMessage {
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| Error::LaneControl(format!("bad lane control payload {payload:?}: {e}")))
    }
}

/// Sends lane commands to (possibly remote) runners.
pub struct NotifyLaneController {
    db: Arc<Db>,
}

impl NotifyLaneController {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    async fn send(&self, command: LaneCommand, lane: &str, worker_id: &str) -> Result<()> {
        let message = LaneControlMessage {
            command,
            lane: lane.to_string(),
            worker_id: worker_id.to_string(),
        };
        let payload = serde_json::to_string(&message)?;
        self.db
            .notify(LANE_CONTROL_CHANNEL, &payload)
            .await
            .map_err(|e| Error::LaneControl(format!("notify failed: {e}")))
    }
}

#[async_trait]
impl LaneController for NotifyLaneController {
    async fn suspend(&self, lane: &str, worker_id: &str) -> Result<()> {
        self.send(LaneCommand::Suspend, lane, worker_id).await
    }

    async fn resume(&self, lane: &str, worker_id: &str) -> Result<()> {
        self.send(LaneCommand::Resume, lane, worker_id).await
    }
}
