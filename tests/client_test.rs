mod common;

use std::sync::Arc;
use std::time::Duration;

use commons_refresh::error::Error;
use commons_refresh::upstream::{
    QueryDescriptor, RateLimitedQueryClient, RetryPolicy, UpstreamResponse,
};
use commons_refresh::lane::{LaneCoordinator, RateLimitHandler};
use common::{BrokenLaneController, ScriptedTransport, payload, recording_handler, throttled};
use serde_json::Value;
use tokio::time::Instant;

fn query() -> QueryDescriptor {
    QueryDescriptor::new("labels", "SELECT ?id ?label WHERE { }")
}

fn client(transport: Arc<ScriptedTransport>) -> RateLimitedQueryClient {
    RateLimitedQueryClient::new(transport, RetryPolicy::default())
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_the_retry_ceiling() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        throttled(10),
        throttled(10),
        throttled(10),
        throttled(10),
    ]));
    let (controller, coordinator, handler) = recording_handler();
    let started = Instant::now();

    let err = client(transport.clone())
        .query_with_retries::<Value>(&query(), 3, Some(&handler))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UpstreamThrottled { attempts: 3, .. }));
    assert!(err.is_throttled());
    assert_eq!(transport.calls(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(20));
    assert_eq!(controller.calls(), vec!["suspend wdqs", "resume wdqs"]);
    assert_eq!(coordinator.holds("wdqs").await, 0);
}

#[tokio::test(start_paused = true)]
async fn recovers_after_throttling() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        throttled(10),
        throttled(10),
        payload(vec![]),
    ]));
    let (controller, _coordinator, handler) = recording_handler();
    let started = Instant::now();

    let result: Value = client(transport.clone())
        .query(&query(), Some(&handler))
        .await
        .unwrap();

    assert!(result["results"]["bindings"].as_array().is_some());
    assert_eq!(transport.calls(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(20));
    assert_eq!(controller.count("suspend"), 1);
    assert_eq!(controller.count("resume"), 1);
}

#[tokio::test(start_paused = true)]
async fn unthrottled_success_never_touches_the_lane() {
    let transport = Arc::new(ScriptedTransport::new(vec![payload(vec![])]));
    let (controller, _coordinator, handler) = recording_handler();

    let _: Value = client(transport)
        .query(&query(), Some(&handler))
        .await
        .unwrap();

    assert!(controller.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resumes_the_lane_when_a_retry_fails_otherwise() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        throttled(5),
        Err(Error::Upstream {
            query: "labels".to_string(),
            status: Some(500),
            message: "internal error".to_string(),
        }),
    ]));
    let (controller, coordinator, handler) = recording_handler();

    let err = client(transport)
        .query::<Value>(&query(), Some(&handler))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Upstream { status: Some(500), .. }));
    assert_eq!(controller.calls(), vec!["suspend wdqs", "resume wdqs"]);
    assert_eq!(coordinator.holds("wdqs").await, 0);
}

#[tokio::test(start_paused = true)]
async fn direct_calls_retry_without_lane_control() {
    let transport = Arc::new(ScriptedTransport::new(vec![throttled(10), payload(vec![])]));
    let started = Instant::now();

    let _: Value = client(transport.clone()).query(&query(), None).await.unwrap();

    assert_eq!(transport.calls(), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn missing_retry_after_falls_back_to_default() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(UpstreamResponse::Throttled { retry_after: None }),
        payload(vec![]),
    ]));
    let started = Instant::now();

    let _: Value = client(transport).query(&query(), None).await.unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn zero_retries_still_makes_one_attempt() {
    let transport = Arc::new(ScriptedTransport::new(vec![throttled(10)]));

    let err = client(transport.clone())
        .query_with_retries::<Value>(&query(), 0, None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UpstreamThrottled { attempts: 1, .. }));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_throttled_calls_suspend_once() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        throttled(10),
        throttled(10),
        payload(vec![]),
        payload(vec![]),
    ]));
    let (controller, coordinator, handler) = recording_handler();
    let client = client(transport.clone());
    let q = query();

    let (a, b) = tokio::join!(
        client.query::<Value>(&q, Some(&handler)),
        client.query::<Value>(&q, Some(&handler)),
    );

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(transport.calls(), 4);
    assert_eq!(controller.calls(), vec!["suspend wdqs", "resume wdqs"]);
    assert_eq!(coordinator.holds("wdqs").await, 0);
}

#[tokio::test(start_paused = true)]
async fn undecodable_payload_is_a_payload_error() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(UpstreamResponse::Payload(
        serde_json::json!({"unexpected": true}),
    ))]));

    let err = client(transport)
        .query::<commons_refresh::upstream::SparqlResults>(&query(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Payload(_)));
}

#[tokio::test(start_paused = true)]
async fn cancelled_call_gives_its_lane_back() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        throttled(10),
        throttled(10),
        payload(vec![]),
    ]));
    let (controller, coordinator, handler) = recording_handler();
    let client = client(transport);

    let cancelled = tokio::time::timeout(
        Duration::from_secs(5),
        client.query::<Value>(&query(), Some(&handler)),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(coordinator.holds("wdqs").await, 0);

    // The resume is sent in the background.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(controller.calls(), vec!["suspend wdqs", "resume wdqs"]);

    // The next throttling episode is reported again.
    let _: Value = client.query(&query(), Some(&handler)).await.unwrap();
    assert_eq!(
        controller.calls(),
        vec!["suspend wdqs", "resume wdqs", "suspend wdqs", "resume wdqs"]
    );
    assert_eq!(coordinator.holds("wdqs").await, 0);
}

#[tokio::test(start_paused = true)]
async fn lane_control_failures_do_not_abort_retries() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        throttled(10),
        throttled(10),
        payload(vec![]),
    ]));
    let controller = Arc::new(BrokenLaneController::default());
    let coordinator = Arc::new(LaneCoordinator::new(controller.clone(), "worker-1"));
    let handler = RateLimitHandler::new(Arc::clone(&coordinator), "wdqs");

    let result: Value = client(transport.clone())
        .query(&query(), Some(&handler))
        .await
        .unwrap();

    assert!(result["results"]["bindings"].as_array().is_some());
    assert_eq!(transport.calls(), 3);
    // One failed suspend, one failed resume.
    assert_eq!(controller.attempts(), 2);
    assert_eq!(coordinator.holds("wdqs").await, 0);
}
