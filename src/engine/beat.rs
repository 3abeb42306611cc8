//! Beat: the periodic trigger.
//!
//! Enqueues each scheduled task on the default lane once per interval. More
//! than one beat may run; the queuing tasks tolerate redundant invocations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info};

use super::queue::TaskQueue;
use crate::error::{Error, Result};
use crate::model::work::{DEFAULT_LANE, Task, TaskEnvelope};

struct Slot {
    every: Duration,
    next: Instant,
    task: Task,
}

pub struct Beat {
    queue: Arc<dyn TaskQueue>,
    slots: Vec<Slot>,
    shutdown: Arc<Notify>,
}

impl Beat {
    /// Every task first fires immediately, then once per `every`. A zero
    /// interval is rejected.
    pub fn new(queue: Arc<dyn TaskQueue>, schedule: Vec<(Duration, Task)>) -> Result<Self> {
        if let Some((_, task)) = schedule.iter().find(|(every, _)| every.is_zero()) {
            return Err(Error::Config(format!(
                "beat entry {} has a zero interval",
                task.name()
            )));
        }
        let now = Instant::now();
        let slots = schedule
            .into_iter()
            .map(|(every, task)| Slot {
                every,
                next: now,
                task,
            })
            .collect();
        Ok(Self {
            queue,
            slots,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Enqueue everything due at `now` and move those slots forward.
    /// Returns how many tasks were enqueued.
    pub async fn tick(&mut self, now: Instant) -> usize {
        let mut sent = 0;
        for slot in self.slots.iter_mut().filter(|slot| slot.next <= now) {
            // Missed ticks collapse into one.
            while slot.next <= now {
                slot.next += slot.every;
            }
            let envelope = TaskEnvelope::new(slot.task.clone());
            match self.queue.enqueue(DEFAULT_LANE, &envelope, None).await {
                Ok(()) => sent += 1,
                Err(e) => error!(task = %slot.task.name(), "beat enqueue failed: {e}"),
            }
        }
        sent
    }

    fn next_due(&self) -> Option<Instant> {
        self.slots.iter().map(|slot| slot.next).min()
    }

    /// Run until the shutdown handle is notified.
    pub async fn run(mut self) -> Result<()> {
        info!(entries = self.slots.len(), "beat started");
        let Some(mut due) = self.next_due() else {
            info!("empty schedule, beat idle");
            self.shutdown.notified().await;
            return Ok(());
        };
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("beat shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep_until(due) => {}
            }
            self.tick(Instant::now()).await;
            if let Some(next) = self.next_due() {
                due = next;
            }
        }
    }
}
