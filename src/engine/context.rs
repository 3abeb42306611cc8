//! What a running task knows about where it is running.

use std::sync::Arc;

use crate::lane::{LaneCoordinator, RateLimitHandler};

/// Execution context handed to workers.
///
/// Inside a runner the context carries the lane coordinator, so throttled
/// queries can pause their lane. Direct invocations (CLI, tests) get no
/// handler and never touch lanes.
#[derive(Clone)]
pub struct ExecutionContext {
    pub worker_id: String,
    pub lane: String,
    lanes: Option<Arc<LaneCoordinator>>,
}

impl ExecutionContext {
    /// A task invoked directly, outside any runner.
    pub fn direct() -> Self {
        Self {
            worker_id: "direct".to_string(),
            lane: String::new(),
            lanes: None,
        }
    }

    /// A task delivered from `lane` to the runner owning `coordinator`.
    pub fn in_worker(lane: &str, coordinator: Arc<LaneCoordinator>) -> Self {
        Self {
            worker_id: coordinator.worker_id().to_string(),
            lane: lane.to_string(),
            lanes: Some(coordinator),
        }
    }

    pub fn is_in_worker(&self) -> bool {
        self.lanes.is_some()
    }

    pub fn rate_limit_handler(&self) -> Option<RateLimitHandler> {
        self.lanes
            .as_ref()
            .map(|coordinator| RateLimitHandler::new(Arc::clone(coordinator), self.lane.clone()))
    }
}
