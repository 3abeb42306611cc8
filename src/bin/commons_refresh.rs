//! commons-refresh CLI: worker daemon and operator interface.

use std::sync::Arc;

use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use commons_refresh::config::Config;
use commons_refresh::config::schedule::Schedule;
use commons_refresh::db::Db;
use commons_refresh::engine::{
    Beat, ExecutionContext, Runner, RunnerConfig, TaskQueue, TaskRouter,
};
use commons_refresh::lane::{LaneController, LaneCoordinator, LocalLanes, NotifyLaneController};
use commons_refresh::model::record::{RecordFilter, RecordKind};
use commons_refresh::model::work::{DEFAULT_LANE, UPSTREAM_LANE};
use commons_refresh::refresh::{OperationRegistry, PeriodicQueuingDispatcher};
use commons_refresh::store::RecordStore;
use commons_refresh::telemetry::{TelemetryConfig, init_telemetry};
use commons_refresh::upstream::{HttpTransport, RateLimitedQueryClient};
use commons_refresh::worker::{WorkerDeps, WorkerSet, country};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(
    name = "commons-refresh",
    about = "Keeps legislative records in sync with Wikidata"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker daemon (runner and beat)
    Serve {
        /// Maximum tasks in flight
        #[arg(long, default_value_t = 4)]
        max_concurrent: usize,
        /// Do not run the periodic trigger in this process
        #[arg(long)]
        no_beat: bool,
    },
    /// Queue refresh work for every stale record of an operation
    Dispatch {
        operation: String,
        /// Records queued more recently than this are left alone
        #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(i64).range(0..))]
        threshold_days: i64,
    },
    /// Queue a refresh of specific records, regardless of staleness
    Trigger {
        operation: String,
        kind: RecordKind,
        /// Record ids (all records of the kind when omitted)
        ids: Vec<String>,
    },
    /// Refresh records now, in this process
    Run {
        operation: String,
        kind: RecordKind,
        /// Record ids (all records of the kind when omitted)
        ids: Vec<String>,
    },
    /// Forget when records were last queued, so the next dispatch picks them up
    Clear {
        operation: String,
        kind: RecordKind,
        /// Record ids (all records of the kind when omitted)
        ids: Vec<String>,
    },
    /// Re-sync the country list now
    Countries,
    /// Suspend or resume a lane on a worker
    Lane {
        #[command(subcommand)]
        action: LaneAction,
    },
    /// List stored records of a kind
    Records {
        kind: RecordKind,
        /// Only records under this parent
        #[arg(long)]
        parent: Option<String>,
    },
}

#[derive(Subcommand)]
enum LaneAction {
    Suspend {
        lane: String,
        #[arg(long)]
        worker: String,
    },
    Resume {
        lane: String,
        #[arg(long)]
        worker: String,
    },
}

/// Everything the commands share.
struct App {
    config: Config,
    db: Arc<Db>,
    dispatcher: Arc<PeriodicQueuingDispatcher>,
    deps: WorkerDeps,
}

impl App {
    async fn connect(config: Config) -> anyhow::Result<Self> {
        let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
        db.migrate().await?;
        for lane in [DEFAULT_LANE, UPSTREAM_LANE] {
            db.create_queue(lane).await?;
        }

        let store: Arc<dyn RecordStore> = db.clone();
        let queue: Arc<dyn TaskQueue> = db.clone();
        let dispatcher = Arc::new(PeriodicQueuingDispatcher::new(
            Arc::clone(&store),
            queue,
            Arc::new(OperationRegistry::standard()),
        ));

        let transport = HttpTransport::new(&config.wdqs_url, &config.wdqs_user_agent)?;
        let client = RateLimitedQueryClient::new(Arc::new(transport), config.retry);
        let deps = WorkerDeps::new(store, Arc::new(client));

        Ok(Self {
            config,
            db,
            dispatcher,
            deps,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "commons-refresh".to_string(),
        log_level: config.log_level.clone(),
    })?;
    let app = App::connect(config).await?;

    match cli.command {
        Command::Serve {
            max_concurrent,
            no_beat,
        } => cmd_serve(app, max_concurrent, no_beat).await,
        Command::Dispatch {
            operation,
            threshold_days,
        } => cmd_dispatch(&app, &operation, threshold_days).await,
        Command::Trigger {
            operation,
            kind,
            ids,
        } => {
            let ids = (!ids.is_empty()).then_some(ids);
            let emitted = app.dispatcher.trigger_refresh(&operation, kind, ids).await?;
            println!("Queued {emitted} work item(s) for {operation} on {kind}");
            Ok(())
        }
        Command::Run {
            operation,
            kind,
            ids,
        } => cmd_run(&app, &operation, kind, ids).await,
        Command::Clear {
            operation,
            kind,
            ids,
        } => {
            let ids = (!ids.is_empty()).then_some(ids);
            let cleared = app
                .dispatcher
                .clear_tokens(&operation, kind, ids.as_deref())
                .await?;
            println!("Cleared {cleared} {operation} token(s) on {kind}");
            Ok(())
        }
        Command::Countries => {
            let count = country::refresh_country_list(&app.deps, &ExecutionContext::direct()).await?;
            println!("{count} countries");
            Ok(())
        }
        Command::Lane { action } => {
            let controller = NotifyLaneController::new(Arc::clone(&app.db));
            match action {
                LaneAction::Suspend { lane, worker } => {
                    controller.suspend(&lane, &worker).await?;
                    println!("Asked {worker} to suspend {lane}");
                }
                LaneAction::Resume { lane, worker } => {
                    controller.resume(&lane, &worker).await?;
                    println!("Asked {worker} to resume {lane}");
                }
            }
            Ok(())
        }
        Command::Records { kind, parent } => cmd_records(&app, kind, parent).await,
    }
}

async fn cmd_serve(app: App, max_concurrent: usize, no_beat: bool) -> anyhow::Result<()> {
    let worker_id = app.config.worker_id.clone();
    let policy = app.deps.client.policy();
    tracing::info!(
        worker_id = %worker_id,
        max_concurrent,
        retries = policy.max_retries,
        default_retry_after = ?policy.default_retry_after,
        "starting worker"
    );

    let lanes = Arc::new(LocalLanes::new(&worker_id));
    let coordinator = Arc::new(LaneCoordinator::new(lanes.clone(), &worker_id));
    let workers = Arc::new(WorkerSet::standard(app.deps.clone()));
    let router = Arc::new(TaskRouter::new(
        Arc::clone(&app.dispatcher),
        workers,
        app.deps.clone(),
    ));

    let mut config = RunnerConfig::new(&worker_id);
    config.max_concurrent = max_concurrent;
    let runner = Runner::new(Arc::clone(&app.db), router, lanes, coordinator, config);

    let beat_shutdown = if no_beat {
        None
    } else {
        let registry = app.dispatcher.registry();
        let schedule = match &app.config.schedule_file {
            Some(path) => Schedule::load(path)?,
            None => Schedule::standard(registry),
        };
        let queue: Arc<dyn TaskQueue> = app.db.clone();
        let beat = Beat::new(queue, schedule.tasks(registry)?)?;
        let shutdown = beat.shutdown_handle();
        tokio::spawn(async move {
            if let Err(e) = beat.run().await {
                tracing::error!("beat stopped: {e}");
            }
        });
        Some(shutdown)
    };

    let ctrl = runner.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
        if let Some(beat) = beat_shutdown {
            beat.notify_one();
        }
    });

    runner.run().await?;
    Ok(())
}

async fn cmd_dispatch(app: &App, operation: &str, threshold_days: i64) -> anyhow::Result<()> {
    let threshold = TimeDelta::try_days(threshold_days)
        .ok_or_else(|| anyhow::anyhow!("threshold out of range: {threshold_days} days"))?;
    let report = app.dispatcher.run(operation, threshold).await?;

    println!("{:<20}  {:>8}  {:>8}  ERROR", "KIND", "CLAIMED", "EMITTED");
    println!("{}", "-".repeat(60));
    for c in &report.collections {
        println!(
            "{:<20}  {:>8}  {:>8}  {}",
            c.kind.as_str(),
            c.claimed,
            c.emitted,
            c.error.as_deref().unwrap_or("-")
        );
    }
    println!(
        "\n{} claimed, {} work item(s) queued at {}",
        report.claimed(),
        report.emitted(),
        report.queued_at
    );

    let failed: Vec<&str> = report.failed().map(|c| c.kind.as_str()).collect();
    if !failed.is_empty() {
        anyhow::bail!("dispatch of {operation} failed for {}", failed.join(", "));
    }
    Ok(())
}

async fn cmd_run(
    app: &App,
    operation: &str,
    kind: RecordKind,
    ids: Vec<String>,
) -> anyhow::Result<()> {
    let ids = (!ids.is_empty()).then_some(ids);
    let items = app
        .dispatcher
        .claim_now(operation, kind, ids.as_deref())
        .await?;
    if items.is_empty() {
        println!("No matching records.");
        return Ok(());
    }

    let workers = WorkerSet::standard(app.deps.clone());
    let ctx = ExecutionContext::direct();
    let (mut written, mut stale) = (0, 0);
    for item in &items {
        let outcome = workers.execute(item, &ctx).await?;
        written += outcome.written;
        stale += outcome.stale;
    }
    println!(
        "{} work item(s): {written} record(s) written, {stale} skipped as stale",
        items.len()
    );
    Ok(())
}

async fn cmd_records(app: &App, kind: RecordKind, parent: Option<String>) -> anyhow::Result<()> {
    let filter = match &parent {
        Some(parent) => RecordFilter::parent(parent),
        None => RecordFilter::default(),
    };
    let records = app.deps.store.select(kind, &filter).await?;
    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }

    println!("{:<24}  {:<40}  {:<12}  UPDATED", "ID", "LABEL (EN)", "PARENT");
    println!("{}", "-".repeat(100));
    for record in &records {
        let label = record.labels.get("en").map(String::as_str).unwrap_or("-");
        let label: String = label.chars().take(40).collect();
        println!(
            "{:<24}  {:<40}  {:<12}  {}",
            record.id,
            label,
            record.parent_id.as_deref().unwrap_or("-"),
            record.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} record(s)", records.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_threshold_is_rejected() {
        assert!(Cli::try_parse_from(["commons-refresh", "dispatch", "members", "--threshold-days", "-1"]).is_err());
        assert!(Cli::try_parse_from(["commons-refresh", "dispatch", "members", "--threshold-days", "0"]).is_ok());
    }

    #[test]
    fn clear_takes_optional_ids() {
        let cli = Cli::try_parse_from(["commons-refresh", "clear", "members", "legislative_house", "Q11268"]).unwrap();
        match cli.command {
            Command::Clear { operation, kind, ids } => {
                assert_eq!(operation, "members");
                assert_eq!(kind, RecordKind::LegislativeHouse);
                assert_eq!(ids, vec!["Q11268".to_string()]);
            }
            _ => panic!("expected clear"),
        }
    }
}
