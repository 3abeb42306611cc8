//! Task queue seam between producers (dispatcher, beat, CLI) and the substrate.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::work::TaskEnvelope;

/// Channel notified when an immediately-deliverable task lands on a lane.
pub const TASK_READY_CHANNEL: &str = "task_ready";

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue `envelope` on `lane`, optionally held back for `delay`.
    async fn enqueue(
        &self,
        lane: &str,
        envelope: &TaskEnvelope,
        delay: Option<Duration>,
    ) -> Result<()>;
}
