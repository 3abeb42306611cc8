mod common;

use std::sync::Arc;

use commons_refresh::engine::{ExecutionContext, TaskOutcome, TaskRouter};
use commons_refresh::lane::{LaneController, LaneCoordinator, LocalLanes};
use commons_refresh::model::record::{Record, RecordKind};
use commons_refresh::model::work::{Task, TaskEnvelope, UPSTREAM_LANE};
use commons_refresh::refresh::{OperationRegistry, PeriodicQueuingDispatcher};
use commons_refresh::store::{MemoryStore, RecordStore};
use commons_refresh::worker::WorkerSet;
use common::{RecordingQueue, ScriptedTransport, item, payload, text, worker_deps};
use serde_json::json;

fn router(
    store: Arc<MemoryStore>,
    queue: Arc<RecordingQueue>,
    transport: Arc<ScriptedTransport>,
) -> TaskRouter {
    let dispatcher = Arc::new(PeriodicQueuingDispatcher::new(
        store.clone(),
        queue,
        Arc::new(OperationRegistry::standard()),
    ));
    let deps = worker_deps(store, transport);
    TaskRouter::new(dispatcher, Arc::new(WorkerSet::standard(deps.clone())), deps)
}

#[tokio::test]
async fn periodic_task_feeds_the_refresh_task() {
    let store = Arc::new(MemoryStore::new());
    store.insert(Record::new(RecordKind::Person, "Q42")).await;
    let queue = Arc::new(RecordingQueue::default());
    let transport = Arc::new(ScriptedTransport::new(vec![payload(vec![json!({
        "id": item("Q42"),
        "label": text("Douglas Adams", "en"),
    })])]));
    let router = router(store.clone(), queue.clone(), transport);
    let ctx = ExecutionContext::direct();

    let outcome = router
        .handle(
            &Task::QueuePeriodically {
                operation: "labels".to_string(),
                threshold_secs: 7 * 24 * 3600,
            },
            &ctx,
        )
        .await
        .unwrap();
    let TaskOutcome::Dispatched(report) = outcome else {
        panic!("expected a dispatch report, got {outcome:?}");
    };
    assert_eq!(report.emitted(), 1);

    // The queued message survives a JSON round trip through the queue.
    let (lane, envelope) = queue.sent().await.remove(0);
    assert_eq!(lane, UPSTREAM_LANE);
    let wire = serde_json::to_value(&envelope).unwrap();
    let envelope: TaskEnvelope = serde_json::from_value(wire).unwrap();

    let outcome = router.handle(&envelope.task, &ctx).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Refreshed(r) if r.written == 1));
    let person = store.get(RecordKind::Person, "Q42").await.unwrap();
    assert_eq!(person.labels.get("en").map(String::as_str), Some("Douglas Adams"));
}

#[tokio::test]
async fn country_list_task_replaces_countries() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::new(vec![payload(vec![json!({
        "item": item("Q30"),
        "itemLabel": text("United States of America", "en"),
    })])]));
    let router = router(store.clone(), Arc::new(RecordingQueue::default()), transport);

    let outcome = router
        .handle(&Task::RefreshCountryList, &ExecutionContext::direct())
        .await
        .unwrap();

    assert!(matches!(outcome, TaskOutcome::Countries(1)));
    assert!(store.get(RecordKind::Country, "Q30").await.is_ok());
}

#[tokio::test]
async fn direct_context_has_no_rate_limit_handler() {
    let ctx = ExecutionContext::direct();
    assert!(!ctx.is_in_worker());
    assert!(ctx.rate_limit_handler().is_none());
}

#[tokio::test]
async fn worker_context_hands_out_its_lane() {
    let lanes = Arc::new(LocalLanes::new("worker-1"));
    let coordinator = Arc::new(LaneCoordinator::new(lanes.clone(), "worker-1"));

    let ctx = ExecutionContext::in_worker(UPSTREAM_LANE, coordinator);
    assert!(ctx.is_in_worker());
    assert_eq!(ctx.worker_id, "worker-1");
    let handler = ctx.rate_limit_handler().unwrap();
    assert_eq!(handler.lane(), UPSTREAM_LANE);
}

#[tokio::test]
async fn local_lanes_obey_only_their_own_worker() {
    let lanes = LocalLanes::new("worker-1");

    lanes.suspend(UPSTREAM_LANE, "worker-2").await.unwrap();
    assert!(!lanes.is_suspended(UPSTREAM_LANE));

    lanes.suspend(UPSTREAM_LANE, "worker-1").await.unwrap();
    lanes.suspend(UPSTREAM_LANE, "worker-1").await.unwrap();
    assert!(lanes.is_suspended(UPSTREAM_LANE));
    assert!(!lanes.is_suspended("default"));

    lanes.resume(UPSTREAM_LANE, "worker-1").await.unwrap();
    assert!(!lanes.is_suspended(UPSTREAM_LANE));
}

#[tokio::test]
async fn negative_threshold_claims_nothing() {
    let store = Arc::new(MemoryStore::new());
    store.insert(Record::new(RecordKind::Person, "Q42")).await;
    let queue = Arc::new(RecordingQueue::default());
    let router = router(
        store.clone(),
        queue.clone(),
        Arc::new(ScriptedTransport::new(vec![])),
    );

    let task = Task::QueuePeriodically {
        operation: "labels".to_string(),
        threshold_secs: -60,
    };
    let result = router.handle(&task, &ExecutionContext::direct()).await;

    assert!(result.is_err());
    assert!(queue.items().await.is_empty());
    assert_eq!(
        store
            .last_queued_at(RecordKind::Person, "Q42", "labels")
            .await
            .unwrap(),
        None
    );
}
