//! Lane suspension: coarse, per-process backpressure.
//!
//! When upstream throttles, the querying task asks its process to stop
//! pulling new work from the lane until the backoff is over. Concurrent
//! throttled calls in one process share a hold count per lane, so the
//! controller sees exactly one suspend and one resume per episode.

pub mod notify;

pub use notify::{LaneCommand, LaneControlMessage, NotifyLaneController};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Pauses and resumes delivery of a lane to one worker process.
///
/// Both calls must be idempotent.
#[async_trait]
pub trait LaneController: Send + Sync {
    async fn suspend(&self, lane: &str, worker_id: &str) -> Result<()>;
    async fn resume(&self, lane: &str, worker_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Local lanes
// ---------------------------------------------------------------------------

/// The set of lanes this process has stopped consuming.
///
/// The runner consults it before every read. Commands addressed to other
/// workers are ignored.
pub struct LocalLanes {
    worker_id: String,
    suspended: RwLock<HashSet<String>>,
}

impl LocalLanes {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            suspended: RwLock::new(HashSet::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_suspended(&self, lane: &str) -> bool {
        self.suspended
            .read()
            .map(|set| set.contains(lane))
            .unwrap_or(false)
    }

    /// Apply a suspend (`true`) or resume (`false`). Returns whether the state changed.
    pub fn set(&self, lane: &str, suspend: bool) -> bool {
        let Ok(mut set) = self.suspended.write() else {
            return false;
        };
        let changed = if suspend {
            set.insert(lane.to_string())
        } else {
            set.remove(lane)
        };
        if changed {
            info!(
                lane,
                worker = %self.worker_id,
                action = if suspend { "suspend" } else { "resume" },
                "lane consumption changed"
            );
        }
        changed
    }

    fn addressed_to_me(&self, worker_id: &str) -> bool {
        if worker_id == self.worker_id {
            true
        } else {
            debug!(worker = worker_id, me = %self.worker_id, "lane command for another worker");
            false
        }
    }
}

#[async_trait]
impl LaneController for LocalLanes {
    async fn suspend(&self, lane: &str, worker_id: &str) -> Result<()> {
        if self.addressed_to_me(worker_id) {
            self.set(lane, true);
        }
        Ok(())
    }

    async fn resume(&self, lane: &str, worker_id: &str) -> Result<()> {
        if self.addressed_to_me(worker_id) {
            self.set(lane, false);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Process-wide hold counts in front of a [`LaneController`].
///
/// The first hold on a lane suspends it and the last release resumes it.
/// Counts are adjusted synchronously, so a hold dropped mid-flight still
/// gives its count back. Controller calls are serialized per coordinator and
/// only issued when the wanted state (held or not) differs from the last one
/// sent. Controller failures are logged and swallowed: backpressure is best
/// effort.
pub struct LaneCoordinator {
    controller: Arc<dyn LaneController>,
    worker_id: String,
    holds: StdMutex<HashMap<String, usize>>,
    /// Lanes the controller was last told to suspend.
    suspended: Mutex<HashSet<String>>,
}

impl LaneCoordinator {
    pub fn new(controller: Arc<dyn LaneController>, worker_id: impl Into<String>) -> Self {
        Self {
            controller,
            worker_id: worker_id.into(),
            holds: StdMutex::new(HashMap::new()),
            suspended: Mutex::new(HashSet::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Current number of in-flight holds on `lane`.
    pub async fn holds(&self, lane: &str) -> usize {
        self.count(lane)
    }

    fn count(&self, lane: &str) -> usize {
        self.lock_holds().get(lane).copied().unwrap_or(0)
    }

    fn lock_holds(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.holds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_hold(&self, lane: &str) {
        *self.lock_holds().entry(lane.to_string()).or_insert(0) += 1;
    }

    /// Give back one hold. Returns false if there was none.
    fn drop_hold(&self, lane: &str) -> bool {
        let mut holds = self.lock_holds();
        match holds.get_mut(lane) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                holds.remove(lane);
            }
            None => {
                warn!(lane, "lane released without a hold");
                return false;
            }
        }
        true
    }

    async fn acquire(&self, lane: &str) {
        self.add_hold(lane);
        self.sync(lane).await;
    }

    async fn release(&self, lane: &str) {
        if self.drop_hold(lane) {
            self.sync(lane).await;
        }
    }

    /// Bring the controller in line with the current hold count.
    async fn sync(&self, lane: &str) {
        // Held across the controller call so suspend/resume cannot reorder.
        let mut suspended = self.suspended.lock().await;
        let want = self.count(lane) > 0;
        if want == suspended.contains(lane) {
            return;
        }
        let action = if want { "suspend" } else { "resume" };
        metrics::lane_transitions().add(
            1,
            &[
                KeyValue::new("lane", lane.to_string()),
                KeyValue::new("action", action),
            ],
        );
        let sent = if want {
            suspended.insert(lane.to_string());
            self.controller.suspend(lane, &self.worker_id).await
        } else {
            suspended.remove(lane);
            self.controller.resume(lane, &self.worker_id).await
        };
        if let Err(e) = sent {
            warn!(lane, worker = %self.worker_id, action, "lane control failed: {e}");
        }
    }
}

/// What a query call uses to pause its own lane while throttled.
#[derive(Clone)]
pub struct RateLimitHandler {
    coordinator: Arc<LaneCoordinator>,
    lane: String,
}

impl RateLimitHandler {
    pub fn new(coordinator: Arc<LaneCoordinator>, lane: impl Into<String>) -> Self {
        Self {
            coordinator,
            lane: lane.into(),
        }
    }

    pub fn lane(&self) -> &str {
        &self.lane
    }

    /// Give back a hold from synchronous code; the resume (if any) runs on
    /// the current runtime.
    fn release_detached(&self) {
        if !self.coordinator.drop_hold(&self.lane) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let coordinator = Arc::clone(&self.coordinator);
                let lane = self.lane.clone();
                runtime.spawn(async move { coordinator.sync(&lane).await });
            }
            Err(_) => warn!(lane = %self.lane, "no runtime to resume lane on"),
        }
    }
}

/// Scoped lane hold for a single query call.
///
/// `hold` takes the hold at most once. `release` gives it back and waits for
/// the controller; dropping a guard that still holds gives it back too, with
/// the resume sent in the background. Without a handler (direct invocation)
/// neither touches a lane.
pub struct LaneGuard<'a> {
    handler: Option<&'a RateLimitHandler>,
    held: bool,
}

impl<'a> LaneGuard<'a> {
    pub fn new(handler: Option<&'a RateLimitHandler>) -> Self {
        Self {
            handler,
            held: false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub async fn hold(&mut self) {
        if self.held {
            return;
        }
        self.held = true;
        if let Some(handler) = self.handler {
            handler.coordinator.acquire(&handler.lane).await;
        }
    }

    pub async fn release(mut self) {
        if !std::mem::take(&mut self.held) {
            return;
        }
        if let Some(handler) = self.handler {
            handler.coordinator.release(&handler.lane).await;
        }
    }
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Some(handler) = self.handler {
            debug!(lane = %handler.lane, "lane hold dropped before release");
            handler.release_detached();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl LaneController for Recorder {
        async fn suspend(&self, lane: &str, worker_id: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("suspend {lane} {worker_id}"));
            Ok(())
        }

        async fn resume(&self, lane: &str, worker_id: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("resume {lane} {worker_id}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn overlapping_holds_suspend_and_resume_once() {
        let recorder = Arc::new(Recorder::default());
        let coordinator = Arc::new(LaneCoordinator::new(recorder.clone(), "node-1"));
        let handler = RateLimitHandler::new(coordinator.clone(), "wdqs");

        let mut a = LaneGuard::new(Some(&handler));
        let mut b = LaneGuard::new(Some(&handler));
        a.hold().await;
        a.hold().await;
        b.hold().await;
        assert_eq!(coordinator.holds("wdqs").await, 2);

        a.release().await;
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
        b.release().await;

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["suspend wdqs node-1", "resume wdqs node-1"]
        );
        assert_eq!(coordinator.holds("wdqs").await, 0);
    }

    #[tokio::test]
    async fn dropped_guard_gives_its_hold_back() {
        let recorder = Arc::new(Recorder::default());
        let coordinator = Arc::new(LaneCoordinator::new(recorder.clone(), "node-1"));
        let handler = RateLimitHandler::new(coordinator.clone(), "wdqs");

        {
            let mut guard = LaneGuard::new(Some(&handler));
            guard.hold().await;
        }
        assert_eq!(coordinator.holds("wdqs").await, 0);

        for _ in 0..10 {
            if recorder.calls.lock().unwrap().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["suspend wdqs node-1", "resume wdqs node-1"]
        );
    }

    #[tokio::test]
    async fn guard_without_handler_is_inert() {
        let mut guard = LaneGuard::new(None);
        guard.hold().await;
        assert!(guard.is_held());
        guard.release().await;
    }

    #[tokio::test]
    async fn local_lanes_ignore_other_workers() {
        let lanes = LocalLanes::new("node-1");
        lanes.suspend("wdqs", "node-2").await.unwrap();
        assert!(!lanes.is_suspended("wdqs"));

        lanes.suspend("wdqs", "node-1").await.unwrap();
        lanes.suspend("wdqs", "node-1").await.unwrap();
        assert!(lanes.is_suspended("wdqs"));
        assert!(!lanes.is_suspended("default"));

        lanes.resume("wdqs", "node-1").await.unwrap();
        lanes.resume("wdqs", "node-1").await.unwrap();
        assert!(!lanes.is_suspended("wdqs"));
    }
}
