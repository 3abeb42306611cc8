//! Runner: listens for tasks on every lane, executes them, retires messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::TimeDelta;
use opentelemetry::KeyValue;
use sqlx::postgres::PgListener;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, warn};

use super::context::ExecutionContext;
use super::queue::TASK_READY_CHANNEL;
use crate::db::Db;
use crate::db::pgmq::PgmqMessage;
use crate::error::{Error, Result};
use crate::lane::notify::LANE_CONTROL_CHANNEL;
use crate::lane::{LaneCommand, LaneControlMessage, LaneController, LaneCoordinator, LocalLanes};
use crate::model::work::{DEFAULT_LANE, Task, TaskEnvelope, UPSTREAM_LANE};
use crate::refresh::{DispatchReport, PeriodicQueuingDispatcher};
use crate::telemetry::metrics;
use crate::telemetry::refresh::{record_task_result, start_task_span};
use crate::worker::{RefreshOutcome, WorkerDeps, WorkerSet, country};

/// What a finished task did.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Dispatched(DispatchReport),
    Refreshed(RefreshOutcome),
    Countries(usize),
}

/// Routes a task to the component that executes it.
pub struct TaskRouter {
    dispatcher: Arc<PeriodicQueuingDispatcher>,
    workers: Arc<WorkerSet>,
    deps: WorkerDeps,
}

impl TaskRouter {
    pub fn new(
        dispatcher: Arc<PeriodicQueuingDispatcher>,
        workers: Arc<WorkerSet>,
        deps: WorkerDeps,
    ) -> Self {
        Self {
            dispatcher,
            workers,
            deps,
        }
    }

    pub async fn handle(&self, task: &Task, ctx: &ExecutionContext) -> Result<TaskOutcome> {
        match task {
            Task::QueuePeriodically {
                operation,
                threshold_secs,
            } => {
                if *threshold_secs < 0 {
                    return Err(Error::Config(format!(
                        "{operation}: negative staleness threshold {threshold_secs}s"
                    )));
                }
                let threshold = TimeDelta::try_seconds(*threshold_secs).unwrap_or(TimeDelta::MAX);
                let report = self.dispatcher.run(operation, threshold).await?;
                Ok(TaskOutcome::Dispatched(report))
            }
            Task::Refresh { item } => {
                let outcome = self.workers.execute(item, ctx).await?;
                Ok(TaskOutcome::Refreshed(outcome))
            }
            Task::RefreshCountryList => {
                let count = country::refresh_country_list(&self.deps, ctx).await?;
                Ok(TaskOutcome::Countries(count))
            }
        }
    }
}

/// Configuration for the runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub worker_id: String,
    /// Lanes this runner consumes.
    pub lanes: Vec<String>,
    /// Visibility timeout (seconds) for pgmq reads.
    pub visibility_timeout: i32,
    /// Poll interval fallback when no NOTIFY arrives.
    pub poll_interval: Duration,
    /// Tasks in flight at once.
    pub max_concurrent: usize,
    /// Reads after which a message is dead-lettered instead of run.
    pub max_deliveries: i32,
}

impl RunnerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            lanes: vec![DEFAULT_LANE.to_string(), UPSTREAM_LANE.to_string()],
            visibility_timeout: 600,
            poll_interval: Duration::from_secs(5),
            max_concurrent: 4,
            max_deliveries: 5,
        }
    }
}

/// The worker loop: listen, read, execute, retire.
#[derive(Clone)]
pub struct Runner {
    db: Arc<Db>,
    router: Arc<TaskRouter>,
    lanes: Arc<LocalLanes>,
    coordinator: Arc<LaneCoordinator>,
    config: RunnerConfig,
    shutdown: Arc<Notify>,
    active: Arc<AtomicUsize>,
}

impl Runner {
    /// `lanes` must be the controller behind `coordinator` for throttling
    /// to pause this runner's own reads.
    pub fn new(
        db: Arc<Db>,
        router: Arc<TaskRouter>,
        lanes: Arc<LocalLanes>,
        coordinator: Arc<LaneCoordinator>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            db,
            router,
            lanes,
            coordinator,
            config,
            shutdown: Arc::new(Notify::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal the runner to stop taking new tasks.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shutdown.
    pub async fn run(&self) -> Result<()> {
        for lane in &self.config.lanes {
            self.db.create_queue(lane).await?;
        }

        let mut listener = PgListener::connect_with(self.db.pool()).await?;
        listener
            .listen_all([TASK_READY_CHANNEL, LANE_CONTROL_CHANNEL])
            .await?;

        info!(
            worker = %self.config.worker_id,
            lanes = ?self.config.lanes,
            "runner started, listening for tasks"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("runner shutting down");
                    return Ok(());
                }
                notif = listener.recv() => {
                    match notif {
                        Ok(n) if n.channel() == LANE_CONTROL_CHANNEL => {
                            self.apply_lane_control(n.payload()).await;
                        }
                        Ok(n) => debug!(lane = n.payload(), "notified of new task"),
                        Err(e) => warn!("PgListener error: {e}, falling back to poll"),
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Err(e) = self.process_lanes().await {
                error!("process_lanes error: {e}");
            }
        }
    }

    async fn apply_lane_control(&self, payload: &str) {
        let message = match LaneControlMessage::parse(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("{e}");
                return;
            }
        };
        let applied = match message.command {
            LaneCommand::Suspend => self.lanes.suspend(&message.lane, &message.worker_id).await,
            LaneCommand::Resume => self.lanes.resume(&message.lane, &message.worker_id).await,
        };
        if let Err(e) = applied {
            warn!(lane = %message.lane, "lane control failed: {e}");
        }
    }

    /// Claim work from every unsuspended lane, up to the concurrency limit.
    async fn process_lanes(&self) -> Result<()> {
        for lane in &self.config.lanes {
            if self.lanes.is_suspended(lane) {
                debug!(lane = %lane, "lane suspended, not reading");
                continue;
            }
            while self.active.load(Ordering::Relaxed) < self.config.max_concurrent {
                let Some(msg) = self
                    .db
                    .read_from_queue(lane, self.config.visibility_timeout)
                    .await?
                else {
                    break;
                };

                self.active.fetch_add(1, Ordering::Relaxed);
                let runner = self.clone();
                let lane = lane.clone();
                tokio::spawn(async move {
                    if let Err(e) = runner.execute(&lane, msg).await {
                        error!(lane = %lane, "task retirement failed: {e}");
                    }
                    runner.active.fetch_sub(1, Ordering::Relaxed);
                });
            }
        }
        Ok(())
    }

    /// Execute one message. Success archives it; failure leaves it for the
    /// visibility timeout to redeliver.
    async fn execute(&self, lane: &str, msg: PgmqMessage) -> Result<()> {
        let envelope: TaskEnvelope = match serde_json::from_value(msg.message.clone()) {
            Ok(e) => e,
            Err(e) => {
                error!(lane, msg_id = msg.msg_id, "undecodable task payload, dead-lettering: {e}");
                finished("unknown", "dead");
                return self.db.archive_message(lane, msg.msg_id).await;
            }
        };
        let name = envelope.task.name();

        if msg.read_ct > self.config.max_deliveries {
            error!(
                lane,
                task = %name,
                id = %envelope.id,
                deliveries = msg.read_ct,
                "delivery limit reached, dead-lettering"
            );
            finished(&name, "dead");
            return self.db.archive_message(lane, msg.msg_id).await;
        }

        let span = start_task_span(&name, &envelope.id, lane);
        async {
            let ctx = ExecutionContext::in_worker(lane, Arc::clone(&self.coordinator));
            let started = Instant::now();
            let result = self.router.handle(&envelope.task, &ctx).await;
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics::operation_duration_ms()
                .record(duration_ms, &[KeyValue::new("operation", name.clone())]);

            match result {
                Ok(outcome) => {
                    record_task_result(&span, "ok");
                    finished(&name, "ok");
                    info!(task = %name, duration_ms, ?outcome, "task completed");
                    self.db.archive_message(lane, msg.msg_id).await?;
                }
                Err(e) => {
                    record_task_result(&span, "error");
                    finished(&name, "error");
                    error!(task = %name, duration_ms, deliveries = msg.read_ct, "task failed: {e}");
                    // Left in the queue: the visibility timeout redelivers it.
                }
            }
            Ok::<(), Error>(())
        }
        .instrument(span.clone())
        .await
    }
}

fn finished(task: &str, result: &'static str) {
    metrics::tasks_finished().add(
        1,
        &[
            KeyValue::new("task", task.to_string()),
            KeyValue::new("result", result),
        ],
    );
}
